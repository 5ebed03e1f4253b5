//! timesync: link and correction workers
//!
//! ## Usage
//!
//! ```bash
//! # Run both stages, two workers each
//! timesync run --role all --concurrency 2
//!
//! # Re-run correction for a session by hand
//! timesync enqueue --kind correction 5f0c...
//!
//! # Decode a payload file and print its header and trigger edges
//! timesync inspect payload.bin --rate 256
//! ```
//!
//! ## Environment variables
//!
//! | Variable                        | Description                                  |
//! |---------------------------------|----------------------------------------------|
//! | `DATABASE_URL`                  | PostgreSQL connection string                 |
//! | `TIMESYNC_CONFIG`               | Path to a TOML config file                   |
//! | `TIMESYNC_QUEUE_URL`            | Separate database for the job queue          |
//! | `TIMESYNC_OBJECT_STORE_ENDPOINT`| Object store gateway (`MINIO_ENDPOINT` too)  |
//! | `TIMESYNC_RAW_DATA_BUCKET`      | Raw payload bucket (`MINIO_RAW_DATA_BUCKET`) |
//! | `TIMESYNC_MAX_REDELIVERIES`     | Dead-letter cutoff for failing jobs          |
//! | `RUST_LOG`                      | Log filter                                   |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use erp_timesync::backoff::Backoff;
use erp_timesync::config::TimesyncConfig;
use erp_timesync::payload::{extract_triggers, parse_header, PayloadChunk, SampleView};
use erp_timesync::queue::{BrokerClient, PgQueue};
use erp_timesync::runtime::{object_store_from_config, Pipeline, Role};
use erp_timesync::store::{create_pool, run_migrations, PgSessionStore};
use erp_timesync::{objects, JobKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// zstd frame magic, little-endian 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Parser, Debug)]
#[command(name = "timesync", about = "Trigger-based event timing correction workers")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file (overrides TIMESYNC_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume job queues until Ctrl+C
    Run {
        /// Stages to consume: link, correct or all
        #[arg(long, default_value = "all")]
        role: Role,

        /// Workers per stage
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Dead-letter after this many redeliveries (default: retry forever)
        #[arg(long)]
        max_redeliveries: Option<u32>,
    },

    /// Publish jobs for sessions by hand
    Enqueue {
        /// link or correction
        #[arg(long)]
        kind: JobKind,

        #[arg(required = true)]
        session_ids: Vec<String>,
    },

    /// Decode a payload file (raw or zstd) and print header and triggers as JSON
    Inspect {
        path: PathBuf,

        /// Absolute start of sample 0 in µs since the epoch
        #[arg(long, default_value_t = 0)]
        start_us: i64,

        /// Sampling rate in Hz
        #[arg(long, default_value_t = 256.0)]
        rate: f64,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,erp_timesync=debug"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(args: &CliArgs) -> Result<TimesyncConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = TimesyncConfig::load_from_file(path)?;
            config.apply_env_with(|key| std::env::var(key).ok());
            config
        }
        None => TimesyncConfig::load(),
    };
    if let Some(url) = &args.database_url {
        config.database.url = url.clone();
    }
    Ok(config)
}

async fn build_pipeline(config: TimesyncConfig) -> Result<Pipeline> {
    if config.database.url.is_empty() {
        anyhow::bail!("DATABASE_URL must be set via --database-url, DATABASE_URL or the config file");
    }

    // ── Relational store ──────────────────────────────────────────────────────
    let pool = create_pool(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let store = Arc::new(PgSessionStore::new(pool.clone()));

    // ── Job queue ─────────────────────────────────────────────────────────────
    let queue_pool = if config.queue_url() == config.database.url {
        pool
    } else {
        let mut queue_db = config.database.clone();
        queue_db.url = config.queue_url().to_string();
        create_pool(&queue_db)
            .await
            .context("Failed to connect to the queue database")?
    };
    run_migrations(&queue_pool).await?;
    let queue = Arc::new(PgQueue::new(queue_pool, config.queue.visibility_timeout()));
    let broker = Arc::new(BrokerClient::new(
        queue,
        Backoff::new(config.queue.reconnect_initial(), config.queue.reconnect_max()),
    ));

    // ── Object store ──────────────────────────────────────────────────────────
    let objects = object_store_from_config(&config.object_store)?;

    Ok(Pipeline::new(config, store, broker, objects))
}

async fn run_workers(pipeline: Pipeline, role: Role, concurrency: usize) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let mut tasks = pipeline.spawn(role, concurrency, &cancel);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task panicked");
        }
    }

    info!("All workers stopped");
    Ok(())
}

async fn enqueue(pipeline: &Pipeline, kind: JobKind, session_ids: &[String]) -> Result<()> {
    for session_id in session_ids {
        let id = pipeline
            .enqueue(kind, session_id)
            .await
            .with_context(|| format!("Failed to enqueue {kind} job for {session_id}"))?;
        info!(session_id = %session_id, kind = %kind, message_id = id, "Job enqueued");
    }
    Ok(())
}

fn inspect(path: &Path, start_us: i64, rate: f64) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let compressed = bytes.starts_with(&ZSTD_MAGIC);
    let raw = if compressed {
        objects::decompress_payload(&bytes)?
    } else {
        bytes
    };

    let header = parse_header(&raw)?;
    let sample_stride = header.sample_stride();
    let sample_count = SampleView::parse(&raw)?.sample_count();
    let label = path.display().to_string();
    let extraction = extract_triggers(&[PayloadChunk {
        label: &label,
        data: &raw,
        start_us,
        sampling_rate_hz: rate,
    }]);

    let report = serde_json::json!({
        "path": label,
        "compressed": compressed,
        "header": header,
        "sample_count": sample_count,
        "sample_stride": sample_stride,
        "triggers_us": extraction.timestamps,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    info!("Shutdown signal received, finishing in-flight jobs");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let args = CliArgs::parse();
    init_tracing(args.log_json);

    match &args.command {
        Command::Run {
            role,
            concurrency,
            max_redeliveries,
        } => {
            let mut config = load_config(&args)?;
            if max_redeliveries.is_some() {
                config.queue.max_redeliveries = *max_redeliveries;
            }
            config.validate()?;
            info!(
                role = ?role,
                concurrency,
                link_queue = %config.queue.link_queue,
                correction_queue = %config.queue.correction_queue,
                max_redeliveries = ?config.queue.max_redeliveries,
                "Starting timesync workers"
            );
            let pipeline = build_pipeline(config).await?;
            run_workers(pipeline, *role, *concurrency).await
        }
        Command::Enqueue { kind, session_ids } => {
            let config = load_config(&args)?;
            config.validate()?;
            let pipeline = build_pipeline(config).await?;
            enqueue(&pipeline, *kind, session_ids).await
        }
        Command::Inspect { path, start_us, rate } => inspect(path, *start_us, *rate),
    }
}

//! `TimesyncConfig`: TOML-backed worker settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

/// Root configuration for the timesync workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TimesyncConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub object_store: ObjectStoreConfig,
    pub linking: LinkingConfig,
    pub correction: CorrectionConfig,
}

/// Relational store connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: defaults::DB_POOL_SIZE,
            acquire_timeout_secs: defaults::DB_ACQUIRE_TIMEOUT_SECS,
        }
    }
}

/// Durable job queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Broker database URL; falls back to `database.url`
    pub url: Option<String>,
    pub link_queue: String,
    pub correction_queue: String,
    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    /// Dead-letter a transiently failing message once it has been redelivered
    /// this many times. Unset = retry forever.
    pub max_redeliveries: Option<u32>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            link_queue: defaults::LINK_QUEUE.to_string(),
            correction_queue: defaults::CORRECTION_QUEUE.to_string(),
            poll_interval_ms: defaults::QUEUE_POLL_INTERVAL_MS,
            visibility_timeout_secs: defaults::QUEUE_VISIBILITY_TIMEOUT_SECS,
            max_redeliveries: None,
            reconnect_initial_ms: defaults::RECONNECT_INITIAL_DELAY_MS,
            reconnect_max_ms: defaults::RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Which object store implementation serves raw payloads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStoreBackend {
    /// `GET {endpoint}/{bucket}/{object_id}`
    #[default]
    Http,
    /// `{root}/{bucket}/{object_id}` on local disk
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub backend: ObjectStoreBackend,
    pub endpoint: String,
    pub root: PathBuf,
    pub bucket: String,
    /// Bearer token for the HTTP gateway
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: ObjectStoreBackend::Http,
            endpoint: "http://minio:9000".to_string(),
            root: PathBuf::from("/var/lib/timesync/objects"),
            bucket: defaults::RAW_DATA_BUCKET.to_string(),
            token: None,
            timeout_secs: defaults::OBJECT_STORE_TIMEOUT_SECS,
            max_attempts: defaults::OBJECT_STORE_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkingConfig {
    pub tolerance_ms: i64,
    pub min_session_duration_ms: i64,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: defaults::NORMALIZATION_TOLERANCE_MS,
            min_session_duration_ms: defaults::MIN_SESSION_DURATION_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorrectionConfig {
    pub match_tolerance_us: i64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            match_tolerance_us: defaults::TRIGGER_MATCH_TOLERANCE_US,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, toml::de::Error),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl TimesyncConfig {
    /// Load configuration using the standard search order, then apply
    /// environment overrides. Falls back to defaults when no file is usable.
    pub fn load() -> Self {
        let mut config = Self::load_file_or_default();
        config.apply_env_with(|key| std::env::var(key).ok());
        config
    }

    fn load_file_or_default() -> Self {
        if let Ok(path) = std::env::var("TIMESYNC_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from TIMESYNC_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from TIMESYNC_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "TIMESYNC_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("timesync.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./timesync.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./timesync.toml, using defaults");
                }
            }
        }

        info!("No config file found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// Blank values are ignored so an exported-but-empty variable does not
    /// wipe a file setting.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = get("TIMESYNC_DATABASE_URL").or_else(|| get("DATABASE_URL")) {
            self.database.url = normalize_database_url(url);
        }
        if let Some(url) = get("TIMESYNC_QUEUE_URL") {
            self.queue.url = Some(normalize_database_url(url));
        }
        if let Some(n) = get("TIMESYNC_DB_POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.database.pool_size = n;
        }
        if let Some(n) = get("TIMESYNC_MAX_REDELIVERIES").and_then(|v| v.parse().ok()) {
            self.queue.max_redeliveries = Some(n);
        }
        if let Some(n) = get("TIMESYNC_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.queue.poll_interval_ms = n;
        }
        if let Some(endpoint) = get("TIMESYNC_OBJECT_STORE_ENDPOINT").or_else(|| get("MINIO_ENDPOINT")) {
            self.object_store.endpoint = normalize_endpoint(&endpoint);
        }
        if let Some(root) = get("TIMESYNC_OBJECT_STORE_ROOT") {
            self.object_store.root = PathBuf::from(root);
            self.object_store.backend = ObjectStoreBackend::Filesystem;
        }
        if let Some(bucket) = get("TIMESYNC_RAW_DATA_BUCKET").or_else(|| get("MINIO_RAW_DATA_BUCKET")) {
            self.object_store.bucket = bucket;
        }
        if let Some(token) = get("TIMESYNC_OBJECT_STORE_TOKEN") {
            self.object_store.token = Some(token);
        }
    }

    /// Broker URL, defaulting to the relational store's URL
    pub fn queue_url(&self) -> &str {
        self.queue.url.as_deref().unwrap_or(&self.database.url)
    }

    /// Check for values that would make the workers misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.database.pool_size == 0 {
            errors.push("database.pool_size must be at least 1".to_string());
        }
        if self.queue.link_queue.trim().is_empty() || self.queue.correction_queue.trim().is_empty() {
            errors.push("queue names must not be empty".to_string());
        }
        if self.queue.link_queue == self.queue.correction_queue {
            errors.push("link_queue and correction_queue must differ".to_string());
        }
        if self.queue.reconnect_initial_ms == 0 {
            errors.push("queue.reconnect_initial_ms must be positive".to_string());
        }
        if self.queue.reconnect_max_ms < self.queue.reconnect_initial_ms {
            errors.push(format!(
                "queue.reconnect_max_ms ({}) must be >= reconnect_initial_ms ({})",
                self.queue.reconnect_max_ms, self.queue.reconnect_initial_ms
            ));
        }
        if self.queue.max_redeliveries == Some(0) {
            errors.push("queue.max_redeliveries must be at least 1 when set".to_string());
        }
        if self.object_store.bucket.trim().is_empty() {
            errors.push("object_store.bucket must not be empty".to_string());
        }
        if self.object_store.max_attempts == 0 {
            errors.push("object_store.max_attempts must be at least 1".to_string());
        }
        if self.linking.tolerance_ms < 0 || self.linking.min_session_duration_ms <= 0 {
            errors.push("linking tolerances must be non-negative and min duration positive".to_string());
        }
        if self.correction.match_tolerance_us < 0 {
            errors.push("correction.match_tolerance_us must be non-negative".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgres+asyncpg://") {
        return format!("postgres://{stripped}");
    }
    url
}

/// Accept bare `host:port` endpoints as plain HTTP.
fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = TimesyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.linking.tolerance_ms, 10_000);
        assert_eq!(config.correction.match_tolerance_us, 500_000);
        assert_eq!(config.queue.max_redeliveries, None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: TimesyncConfig = toml::from_str(
            r#"
            [queue]
            max_redeliveries = 5

            [object_store]
            backend = "filesystem"
            root = "/data/objects"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_redeliveries, Some(5));
        assert_eq!(config.queue.link_queue, defaults::LINK_QUEUE);
        assert_eq!(config.object_store.backend, ObjectStoreBackend::Filesystem);
        assert_eq!(config.object_store.bucket, defaults::RAW_DATA_BUCKET);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgresql+psycopg://u:p@db:5432/erp"),
            ("MINIO_ENDPOINT", "minio:9000"),
            ("MINIO_RAW_DATA_BUCKET", "eeg-raw"),
            ("TIMESYNC_MAX_REDELIVERIES", "12"),
            ("TIMESYNC_OBJECT_STORE_TOKEN", "   "),
        ]);
        let mut config = TimesyncConfig::default();
        config.apply_env_with(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.url, "postgresql://u:p@db:5432/erp");
        assert_eq!(config.queue_url(), "postgresql://u:p@db:5432/erp");
        assert_eq!(config.object_store.endpoint, "http://minio:9000");
        assert_eq!(config.object_store.bucket, "eeg-raw");
        assert_eq!(config.queue.max_redeliveries, Some(12));
        assert_eq!(config.object_store.token, None);
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = TimesyncConfig::default();
        config.database.pool_size = 0;
        config.queue.reconnect_max_ms = 10;
        config.queue.correction_queue = config.queue.link_queue.clone();
        match config.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timesync.toml");
        std::fs::write(&path, "[correction]\nmatch_tolerance_us = 250000\n").unwrap();
        let config = TimesyncConfig::load_from_file(&path).unwrap();
        assert_eq!(config.correction.match_tolerance_us, 250_000);

        std::fs::write(&path, "[database]\npool_size = 0\n").unwrap();
        assert!(matches!(
            TimesyncConfig::load_from_file(&path),
            Err(ConfigError::Validation(_))
        ));
    }
}

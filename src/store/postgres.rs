//! PostgreSQL store backend
//!
//! Each job transaction owns one pooled connection and drives it with
//! explicit `BEGIN` / `COMMIT` / `ROLLBACK`, so a connection that failed at
//! the transport level can be closed instead of going back into the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SessionStore, StoreError, StoreTx};
use crate::config::DatabaseConfig;
use crate::types::{ClockOffsetInfo, ProcessingStatus, RawSensorObject, Session, SessionEvent};

const SESSION_COLUMNS: &str = "session_id, user_id, experiment_id, start_time, end_time, \
     clock_offset_info, link_status, event_correction_status";

const OBJECT_COLUMNS: &str = "rdo.object_id, rdo.user_id, rdo.session_id, rdo.device_id, \
     rdo.sampling_rate, rdo.start_time_device, rdo.end_time_device, rdo.start_time, rdo.end_time";

/// Create a PostgreSQL connection pool
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .test_before_acquire(true)
        .connect(&config.url)
        .await?;

    info!(pool_size = config.pool_size, "Connected to PostgreSQL");
    Ok(pool)
}

/// Run the queue table migrations from the migrations/ directory
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Migrations complete");
    Ok(())
}

fn status_column(link: bool) -> &'static str {
    if link {
        "link_status"
    } else {
        "event_correction_status"
    }
}

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    let session_id: String = row.try_get("session_id")?;
    let clock_offset_info = match row.try_get::<Option<serde_json::Value>, _>("clock_offset_info")? {
        Some(value) => match serde_json::from_value::<ClockOffsetInfo>(value) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Unreadable clock_offset_info, treating as absent");
                None
            }
        },
        None => None,
    };
    let status = |column: &str| -> Result<ProcessingStatus, StoreError> {
        let raw: Option<String> = row.try_get(column)?;
        Ok(raw
            .as_deref()
            .and_then(ProcessingStatus::parse)
            .unwrap_or_default())
    };

    Ok(Session {
        user_id: row.try_get("user_id")?,
        experiment_id: row.try_get("experiment_id")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        clock_offset_info,
        link_status: status("link_status")?,
        event_correction_status: status("event_correction_status")?,
        session_id,
    })
}

fn object_from_row(row: &PgRow) -> Result<RawSensorObject, StoreError> {
    Ok(RawSensorObject {
        object_id: row.try_get("object_id")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        device_id: row.try_get("device_id")?,
        sampling_rate: row.try_get("sampling_rate")?,
        start_time_device: row.try_get("start_time_device")?,
        end_time_device: row.try_get("end_time_device")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<SessionEvent, StoreError> {
    Ok(SessionEvent {
        event_id: row.try_get("event_id")?,
        session_id: row.try_get("session_id")?,
        onset: row.try_get("onset")?,
        duration: row.try_get("duration")?,
        trial_type: row.try_get("trial_type")?,
        onset_corrected_us: row.try_get("onset_corrected_us")?,
    })
}

/// Production store over a shared `PgPool`.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn mark_status(
        &self,
        session_id: &str,
        link: bool,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE sessions SET {} = $2 WHERE session_id = $1",
            status_column(link)
        );
        let result = sqlx::query(&sql)
            .bind(session_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(session_id, status = %status, "Status update matched no session");
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        if let Err(e) = sqlx::query("BEGIN").execute(&mut *conn).await {
            let err = StoreError::from(e);
            if err.is_connection() {
                let _ = conn.close().await;
            }
            return Err(err);
        }
        Ok(Box::new(PgStoreTx { conn: Some(conn) }))
    }

    async fn mark_link_status(
        &self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        self.mark_status(session_id, true, status).await
    }

    async fn mark_correction_status(
        &self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        self.mark_status(session_id, false, status).await
    }

    async fn session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1");
        let row = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    fn backend_name(&self) -> &'static str {
        "PostgreSQL"
    }
}

/// One job transaction on a dedicated pooled connection.
struct PgStoreTx {
    conn: Option<PoolConnection<Postgres>>,
}

impl PgStoreTx {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>, StoreError> {
        self.conn.as_mut().ok_or(StoreError::Finished)
    }

    /// Convert a query result, closing the connection on transport failure.
    async fn check<T>(&mut self, result: Result<T, sqlx::Error>) -> Result<T, StoreError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = StoreError::from(e);
                if err.is_connection() {
                    if let Some(conn) = self.conn.take() {
                        warn!(error = %err, "Closing broken database connection");
                        let _ = conn.close().await;
                    }
                }
                Err(err)
            }
        }
    }

    async fn set_status(
        &mut self,
        session_id: &str,
        link: bool,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE sessions SET {} = $2 WHERE session_id = $1",
            status_column(link)
        );
        let conn = self.conn()?;
        let result = sqlx::query(&sql)
            .bind(session_id)
            .bind(status.as_str())
            .execute(&mut **conn)
            .await;
        self.check(result).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>, statement: &'static str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = sqlx::query(statement).execute(&mut **conn).await;
        match result {
            Ok(_) => {
                // Hand the healthy connection back to the pool.
                self.conn.take();
                Ok(())
            }
            Err(e) => {
                // State unknown after a failed COMMIT/ROLLBACK: never reuse it.
                if let Some(conn) = self.conn.take() {
                    let _ = conn.close().await;
                }
                Err(StoreError::from(e))
            }
        }
    }
}

impl Drop for PgStoreTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // No async rollback possible here; dropping the detached
            // connection closes the socket and the server aborts the transaction.
            debug!("Discarding connection of unfinished transaction");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn session_for_update(&mut self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1 FOR UPDATE");
        let conn = self.conn()?;
        let result = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&mut **conn)
            .await;
        let row = self.check(result).await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn set_link_status(
        &mut self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        self.set_status(session_id, true, status).await
    }

    async fn set_correction_status(
        &mut self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        self.set_status(session_id, false, status).await
    }

    async fn normalization_candidates(
        &mut self,
        user_id: &str,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> Result<Vec<RawSensorObject>, StoreError> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM raw_data_objects rdo \
             WHERE rdo.user_id = $1 \
               AND rdo.start_time_device IS NOT NULL \
               AND rdo.end_time_device IS NOT NULL \
               AND (rdo.start_time IS NULL OR rdo.start_time < $2 OR rdo.start_time > $3) \
             ORDER BY rdo.start_time_device ASC, rdo.object_id ASC"
        );
        let conn = self.conn()?;
        let result = sqlx::query(&sql)
            .bind(user_id)
            .bind(lower)
            .bind(upper)
            .fetch_all(&mut **conn)
            .await;
        let rows = self.check(result).await?;
        rows.iter().map(object_from_row).collect()
    }

    async fn update_object_times(
        &mut self,
        object_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = sqlx::query(
            "UPDATE raw_data_objects SET start_time = $2, end_time = $3 WHERE object_id = $1",
        )
        .bind(object_id)
        .bind(start_time)
        .bind(end_time)
        .execute(&mut **conn)
        .await;
        self.check(result).await?;
        Ok(())
    }

    async fn link_overlapping_objects(
        &mut self,
        session_id: &str,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let result = sqlx::query(
            r#"
            INSERT INTO session_object_links (session_id, object_id)
            SELECT $1, object_id
            FROM   raw_data_objects
            WHERE  user_id = $2
              AND  start_time IS NOT NULL
              AND  end_time IS NOT NULL
              AND  start_time <= $4
              AND  end_time >= $3
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(start)
        .bind(end)
        .execute(&mut **conn)
        .await;
        Ok(self.check(result).await?.rows_affected())
    }

    async fn propagate_experiment_id(
        &mut self,
        session_id: &str,
        experiment_id: &str,
    ) -> Result<u64, StoreError> {
        let mut updated = 0;
        for table in ["images", "audio_clips"] {
            let sql = format!(
                "UPDATE {table} SET experiment_id = $2 \
                 WHERE session_id = $1 AND experiment_id IS NULL"
            );
            let conn = self.conn()?;
            let result = sqlx::query(&sql)
                .bind(session_id)
                .bind(experiment_id)
                .execute(&mut **conn)
                .await;
            updated += self.check(result).await?.rows_affected();
        }
        Ok(updated)
    }

    async fn session_events(&mut self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        let conn = self.conn()?;
        let result = sqlx::query(
            "SELECT event_id, session_id, onset, duration, trial_type, onset_corrected_us \
             FROM session_events WHERE session_id = $1 \
             ORDER BY onset ASC, event_id ASC",
        )
        .bind(session_id)
        .fetch_all(&mut **conn)
        .await;
        let rows = self.check(result).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn linked_objects(&mut self, session_id: &str) -> Result<Vec<RawSensorObject>, StoreError> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM raw_data_objects rdo \
             JOIN session_object_links sol ON rdo.object_id = sol.object_id \
             WHERE sol.session_id = $1 \
             ORDER BY rdo.start_time ASC NULLS LAST, rdo.object_id ASC"
        );
        let conn = self.conn()?;
        let result = sqlx::query(&sql)
            .bind(session_id)
            .fetch_all(&mut **conn)
            .await;
        let rows = self.check(result).await?;
        rows.iter().map(object_from_row).collect()
    }

    async fn set_event_onset_corrected(
        &mut self,
        event_id: i64,
        onset_corrected_us: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = sqlx::query("UPDATE session_events SET onset_corrected_us = $2 WHERE event_id = $1")
            .bind(event_id)
            .bind(onset_corrected_us)
            .execute(&mut **conn)
            .await;
        self.check(result).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await
    }
}

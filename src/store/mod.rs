//! Relational store access for the link and correction jobs
//!
//! Two seams, both `async_trait` so workers can hold them as trait objects:
//! - [`SessionStore`]: long-lived handle (shared pool). Opens transactions and
//!   writes status transitions that must survive an aborted job.
//! - [`StoreTx`]: one job's transaction. Everything a job changes goes through
//!   it and becomes visible only on [`StoreTx::commit`].
//!
//! Backends:
//! - [`PgSessionStore`]: PostgreSQL via sqlx (production)
//! - [`InMemoryStore`]: serialized in-memory tables for tests and dry runs
//!
//! The domain tables (`sessions`, `raw_data_objects`, `session_object_links`,
//! `session_events`, `images`, `audio_clips`) are owned by the platform; this
//! crate only reads and updates the columns listed on [`crate::types`].

mod memory;
mod postgres;

pub use memory::{InMemoryStore, MediaKind};
pub use postgres::{create_pool, run_migrations, PgSessionStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{ProcessingStatus, RawSensorObject, Session, SessionEvent};

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("row decode error: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("transaction already finished")]
    Finished,
}

impl StoreError {
    /// True when the underlying connection can no longer be trusted and must
    /// be closed instead of returned to the pool.
    pub fn is_connection(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::Unavailable(_) => true,
            StoreError::Decode(_) | StoreError::Finished => false,
        }
    }

    /// True when retrying the same job later may succeed.
    ///
    /// Serialization failures and deadlocks are retryable on top of
    /// connection-level errors.
    pub fn is_transient(&self) -> bool {
        if self.is_connection() {
            return true;
        }
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40001") | Some("40P01") | Some("57P01"))
            }
            _ => false,
        }
    }

    /// True when the same statement will fail again on retry: rows that do
    /// not decode, schema mismatches, data and syntax errors (SQLSTATE
    /// classes 22 and 42).
    pub fn is_permanent(&self) -> bool {
        match self {
            StoreError::Decode(_) => true,
            StoreError::Database(e) => match e {
                sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::Decode(_)
                | sqlx::Error::ColumnNotFound(_)
                | sqlx::Error::ColumnIndexOutOfBounds { .. }
                | sqlx::Error::TypeNotFound { .. } => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .is_some_and(|code| code.starts_with("22") || code.starts_with("42")),
                _ => false,
            },
            StoreError::Unavailable(_) | StoreError::Finished => false,
        }
    }
}

/// Long-lived handle to the relational store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Open a transaction on a dedicated connection.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Write `link_status` on a fresh connection, outside any job transaction.
    async fn mark_link_status(
        &self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError>;

    /// Write `event_correction_status` on a fresh connection.
    async fn mark_correction_status(
        &self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError>;

    /// Read a session without locking it.
    async fn session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// One job's transaction.
///
/// Dropping an unfinished transaction discards its writes.
#[async_trait]
pub trait StoreTx: Send {
    /// Load and lock the session row. `None` when it does not exist.
    async fn session_for_update(&mut self, session_id: &str) -> Result<Option<Session>, StoreError>;

    async fn set_link_status(
        &mut self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError>;

    async fn set_correction_status(
        &mut self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError>;

    /// Objects of `user_id` with both device times present and an absolute
    /// start that is missing or outside `[lower, upper]`.
    async fn normalization_candidates(
        &mut self,
        user_id: &str,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> Result<Vec<RawSensorObject>, StoreError>;

    async fn update_object_times(
        &mut self,
        object_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Link every object of `user_id` whose absolute range intersects
    /// `[start, end]`. Existing links are left alone; returns new links.
    async fn link_overlapping_objects(
        &mut self,
        session_id: &str,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Copy the session's experiment onto its images and audio clips that
    /// have none. Returns rows updated.
    async fn propagate_experiment_id(
        &mut self,
        session_id: &str,
        experiment_id: &str,
    ) -> Result<u64, StoreError>;

    /// Events of the session ordered by onset.
    async fn session_events(&mut self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError>;

    /// Linked objects ordered by normalized start time.
    async fn linked_objects(&mut self, session_id: &str) -> Result<Vec<RawSensorObject>, StoreError>;

    async fn set_event_onset_corrected(
        &mut self,
        event_id: i64,
        onset_corrected_us: i64,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = StoreError::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(io.is_connection());
        assert!(io.is_transient());

        let timed_out = StoreError::Database(sqlx::Error::PoolTimedOut);
        assert!(timed_out.is_transient());

        let missing = StoreError::Database(sqlx::Error::RowNotFound);
        assert!(!missing.is_connection());
        assert!(!missing.is_transient());

        assert!(!StoreError::Decode("bad json".into()).is_transient());
        assert!(StoreError::Unavailable("down".into()).is_connection());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(StoreError::Decode("bad json".into()).is_permanent());
        assert!(StoreError::Database(sqlx::Error::ColumnNotFound("onset".into())).is_permanent());
        assert!(!StoreError::Database(sqlx::Error::PoolTimedOut).is_permanent());
        assert!(!StoreError::Unavailable("down".into()).is_permanent());
        // neither side claims it
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_permanent());
    }
}

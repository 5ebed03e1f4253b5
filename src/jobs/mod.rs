//! Job handlers for the two pipeline stages
//!
//! A handler runs inside a transaction opened by the [`crate::worker`]
//! harness and returns a tagged result instead of raising:
//!
//! | Result        | Harness action                                  |
//! |---------------|-------------------------------------------------|
//! | `Ok(summary)` | set status `completed` in the tx, commit, ack   |
//! | `Transient`   | rollback, mark `failed`, nack for redelivery    |
//! | `Business`    | rollback, mark `failed`, ack (no retry)         |
//! | `Permanent`   | rollback, mark `failed`, ack and discard        |
//!
//! Store and object-store errors convert through their `is_transient` /
//! `is_permanent` classification; anything unclassified is retried.

pub mod correct;
pub mod link;

pub use correct::{CorrectionJob, CorrectionSummary};
pub use link::{LinkJob, LinkSummary};

use async_trait::async_trait;

use crate::objects::ObjectStoreError;
use crate::store::{SessionStore, StoreError, StoreTx};
use crate::types::{JobKind, ProcessingStatus};

/// Tagged job failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Infrastructure trouble; the same message may succeed later
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying can never succeed (undecodable row, access denied)
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// Session state forbids processing (missing row, missing time fields)
    #[error("business state error: {0}")]
    Business(String),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Transient(_) => "transient",
            JobError::Permanent(_) => "permanent",
            JobError::Business(_) => "business",
        }
    }
}

// Unclassified store failures are retried.
impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        if !e.is_transient() && e.is_permanent() {
            JobError::Permanent(e.to_string())
        } else {
            JobError::Transient(e.to_string())
        }
    }
}

impl From<ObjectStoreError> for JobError {
    fn from(e: ObjectStoreError) -> Self {
        if e.is_transient() {
            JobError::Transient(e.to_string())
        } else {
            JobError::Permanent(e.to_string())
        }
    }
}

/// What a successful job did, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSummary {
    Link(LinkSummary),
    Correction(CorrectionSummary),
}

/// One pipeline stage.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Process one session inside `tx`. Must not commit or roll back.
    async fn run(&self, tx: &mut dyn StoreTx, session_id: &str) -> Result<JobSummary, JobError>;
}

/// Set this stage's status column inside a transaction.
pub async fn set_status_in_tx(
    tx: &mut dyn StoreTx,
    kind: JobKind,
    session_id: &str,
    status: ProcessingStatus,
) -> Result<(), StoreError> {
    match kind {
        JobKind::Link => tx.set_link_status(session_id, status).await,
        JobKind::Correction => tx.set_correction_status(session_id, status).await,
    }
}

/// Set this stage's status column outside any job transaction.
pub async fn mark_status(
    store: &dyn SessionStore,
    kind: JobKind,
    session_id: &str,
    status: ProcessingStatus,
) -> Result<(), StoreError> {
    match kind {
        JobKind::Link => store.mark_link_status(session_id, status).await,
        JobKind::Correction => store.mark_correction_status(session_id, status).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_conversion() {
        let err: JobError = StoreError::Decode("weird row".into()).into();
        assert_eq!(err.kind(), "permanent");

        let err: JobError = StoreError::Unavailable("down".into()).into();
        assert_eq!(err.kind(), "transient");

        // unclassified
        let err: JobError = StoreError::Database(sqlx::Error::RowNotFound).into();
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn test_object_store_error_conversion() {
        let err: JobError = ObjectStoreError::Status(reqwest::StatusCode::FORBIDDEN).into();
        assert!(matches!(err, JobError::Permanent(_)));

        let err: JobError = ObjectStoreError::Status(reqwest::StatusCode::UNAUTHORIZED).into();
        assert!(matches!(err, JobError::Permanent(_)));

        let err: JobError = ObjectStoreError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE).into();
        assert!(matches!(err, JobError::Transient(_)));

        let err: JobError = ObjectStoreError::Unavailable("gateway down".into()).into();
        assert!(matches!(err, JobError::Transient(_)));
    }
}

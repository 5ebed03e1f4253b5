//! Job pipeline harness
//!
//! A [`Worker`] consumes one queue, one message at a time:
//!
//! 1. Claim a message and decode `{"session_id": ...}`; undecodable bodies
//!    are acked and dropped.
//! 2. Mark the stage `processing` outside the job transaction.
//! 3. Open a transaction, run the handler, set `completed` and commit.
//! 4. Settle the message according to the handler's tagged result.
//!
//! A committed link job publishes exactly one correction job for the same
//! session before its own message is acked.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::defaults::QUEUE_POLL_INTERVAL_MS;
use crate::jobs::{mark_status, set_status_in_tx, JobError, JobHandler, JobSummary};
use crate::queue::{BrokerClient, Delivery, QueueError};
use crate::store::SessionStore;
use crate::types::{JobKind, ProcessingStatus, SessionJobMessage};

/// How a delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Job committed and message acked
    Completed(JobSummary),
    /// Transient failure, message released for redelivery
    Requeued(String),
    /// Transient failure past the redelivery limit
    DeadLettered(String),
    /// Business-state failure, message acked without retry
    Rejected(String),
    /// Message could never be processed
    Discarded(String),
}

pub struct Worker {
    name: String,
    queue: String,
    broker: Arc<BrokerClient>,
    store: Arc<dyn SessionStore>,
    handler: Arc<dyn JobHandler>,
    followup_queue: Option<String>,
    max_redeliveries: Option<u32>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: impl Into<String>,
        broker: Arc<BrokerClient>,
        store: Arc<dyn SessionStore>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let kind = handler.kind();
        Self {
            name: format!("{kind}-worker"),
            queue: queue.into(),
            broker,
            store,
            handler,
            followup_queue: None,
            max_redeliveries: None,
            poll_interval: Duration::from_millis(QUEUE_POLL_INTERVAL_MS),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Queue that receives a job for the same session after each commit.
    pub fn with_followup(mut self, queue: impl Into<String>) -> Self {
        self.followup_queue = Some(queue.into());
        self
    }

    pub fn with_max_redeliveries(mut self, max: Option<u32>) -> Self {
        self.max_redeliveries = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.handler.kind()
    }

    /// Run until `cancel` fires. The in-flight job always finishes first.
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.name, queue = %self.queue, "Worker started");

        while !cancel.is_cancelled() {
            match self.process_one(&cancel).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) if e.is_connection() => {
                    warn!(worker = %self.name, error = %e, "Broker connection lost");
                    if self.broker.reconnect(&cancel).await.is_err() {
                        break;
                    }
                }
                Err(QueueError::Cancelled) => break,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Queue error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!(worker = %self.name, "Worker stopped");
    }

    /// Claim and process one message. `Ok(None)` when the queue is empty.
    pub async fn process_one(&self, cancel: &CancellationToken) -> Result<Option<Outcome>, QueueError> {
        let Some(delivery) = self.broker.fetch(&self.queue).await? else {
            return Ok(None);
        };
        let span = info_span!(
            "job",
            worker = %self.name,
            message_id = delivery.id,
            delivery = delivery.delivery_count
        );
        Ok(Some(self.handle(delivery, cancel).instrument(span).await))
    }

    async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) -> Outcome {
        let message = match SessionJobMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(reason) => {
                warn!(
                    body = %String::from_utf8_lossy(&delivery.body),
                    reason = %reason,
                    "Discarding malformed message"
                );
                self.settle_ack(&delivery).await;
                return Outcome::Discarded(reason);
            }
        };
        let session_id = message.session_id.as_str();
        let kind = self.kind();
        if delivery.is_redelivery() {
            info!(session_id, kind = %kind, "Processing redelivered job");
        } else {
            debug!(session_id, kind = %kind, "Processing job");
        }

        self.mark(session_id, ProcessingStatus::Processing).await;

        match self.execute(session_id).await {
            Ok(summary) => {
                if let Some(queue) = &self.followup_queue {
                    if let Err(e) = self
                        .broker
                        .publish_reliably(queue, &message.encode(), cancel)
                        .await
                    {
                        // The committed work is idempotent; redelivery re-publishes.
                        warn!(session_id, queue = %queue, error = %e, "Follow-up publish failed, requeueing");
                        self.settle_nack(&delivery, &e.to_string()).await;
                        return Outcome::Requeued(e.to_string());
                    }
                    debug!(session_id, queue = %queue, "Follow-up job published");
                }
                self.settle_ack(&delivery).await;
                info!(session_id, kind = %kind, "Job completed");
                Outcome::Completed(summary)
            }
            Err(err) => {
                warn!(session_id, kind = %kind, error_kind = err.kind(), error = %err, "Job failed");
                match err {
                    JobError::Permanent(reason) => {
                        self.mark(session_id, ProcessingStatus::Failed).await;
                        self.settle_ack(&delivery).await;
                        Outcome::Discarded(reason)
                    }
                    JobError::Business(reason) => {
                        self.mark(session_id, ProcessingStatus::Failed).await;
                        self.settle_ack(&delivery).await;
                        Outcome::Rejected(reason)
                    }
                    JobError::Transient(reason) => {
                        self.mark(session_id, ProcessingStatus::Failed).await;
                        if self.redeliveries_exhausted(&delivery) {
                            warn!(
                                session_id,
                                redeliveries = delivery.delivery_count.saturating_sub(1),
                                "Redelivery limit reached, dead-lettering"
                            );
                            if let Err(e) = self.broker.dead_letter(&delivery, &reason).await {
                                warn!(error = %e, "Dead-letter failed, message will be redelivered");
                            }
                            Outcome::DeadLettered(reason)
                        } else {
                            self.settle_nack(&delivery, &reason).await;
                            Outcome::Requeued(reason)
                        }
                    }
                }
            }
        }
    }

    /// Transaction boundary: every exit path commits or rolls back.
    async fn execute(&self, session_id: &str) -> Result<JobSummary, JobError> {
        let mut tx = self.store.begin().await?;
        let kind = self.kind();

        let result = async {
            let summary = self.handler.run(tx.as_mut(), session_id).await?;
            set_status_in_tx(tx.as_mut(), kind, session_id, ProcessingStatus::Completed).await?;
            Ok::<_, JobError>(summary)
        }
        .await;

        match result {
            Ok(summary) => {
                tx.commit().await?;
                Ok(summary)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(session_id, error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn redeliveries_exhausted(&self, delivery: &Delivery) -> bool {
        self.max_redeliveries
            .is_some_and(|max| delivery.delivery_count.saturating_sub(1) >= max)
    }

    /// Status write on a fresh connection; failures are logged, not fatal.
    async fn mark(&self, session_id: &str, status: ProcessingStatus) {
        if let Err(e) = mark_status(self.store.as_ref(), self.kind(), session_id, status).await {
            warn!(session_id, status = %status, error = %e, "Failed to record job status");
        }
    }

    async fn settle_ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            warn!(error = %e, "Ack failed, message will be redelivered");
        }
    }

    async fn settle_nack(&self, delivery: &Delivery, reason: &str) {
        if let Err(e) = self.broker.nack(delivery, reason).await {
            warn!(error = %e, "Nack failed, message becomes visible after the timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::jobs::LinkJob;
    use crate::objects::ObjectStoreError;
    use crate::queue::{MemoryQueue, QueueBackend};
    use crate::store::{InMemoryStore, StoreError};
    use crate::types::Session;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    struct FailingJob(JobError);

    #[async_trait]
    impl JobHandler for FailingJob {
        fn kind(&self) -> JobKind {
            JobKind::Correction
        }

        async fn run(
            &self,
            tx: &mut dyn crate::store::StoreTx,
            session_id: &str,
        ) -> Result<JobSummary, JobError> {
            // A write that must be rolled back.
            tx.set_link_status(session_id, ProcessingStatus::Completed).await?;
            Err(self.0.clone())
        }
    }

    fn session() -> Session {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        Session {
            session_id: "s1".into(),
            user_id: "u1".into(),
            experiment_id: None,
            start_time: Some(start),
            end_time: Some(start + ChronoDuration::seconds(30)),
            clock_offset_info: None,
            link_status: ProcessingStatus::Pending,
            event_correction_status: ProcessingStatus::Pending,
        }
    }

    async fn setup(handler: Arc<dyn JobHandler>) -> (Worker, Arc<MemoryQueue>, InMemoryStore) {
        let queue = Arc::new(MemoryQueue::new());
        let broker = Arc::new(BrokerClient::new(
            queue.clone(),
            Backoff::new(std::time::Duration::from_millis(1), std::time::Duration::from_millis(2)),
        ));
        let store = InMemoryStore::new();
        store.insert_session(session()).await;
        let worker = Worker::new("jobs", broker, Arc::new(store.clone()), handler);
        (worker, queue, store)
    }

    async fn enqueue(queue: &MemoryQueue, body: &[u8]) {
        queue.publish("jobs", body).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (worker, _, _) = setup(Arc::new(LinkJob::default())).await;
        assert!(worker.process_one(&CancellationToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_message_discarded() {
        let (worker, queue, _) = setup(Arc::new(LinkJob::default())).await;
        enqueue(&queue, b"{broken").await;
        let outcome = worker.process_one(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, Some(Outcome::Discarded(_))));
        assert_eq!(queue.depth("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_link_success_enqueues_followup() {
        let (worker, queue, store) = setup(Arc::new(LinkJob::default())).await;
        let worker = worker.with_followup("corrections");
        enqueue(&queue, &SessionJobMessage::new("s1").encode()).await;

        let outcome = worker.process_one(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, Some(Outcome::Completed(JobSummary::Link(_)))));
        assert_eq!(queue.depth("jobs").await.unwrap(), 0);
        assert_eq!(queue.bodies("corrections"), vec![br#"{"session_id":"s1"}"#.to_vec()]);

        let s = store.session("s1").await.unwrap().unwrap();
        assert_eq!(s.link_status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn test_business_failure_acks_and_marks_failed() {
        let (worker, queue, store) =
            setup(Arc::new(FailingJob(JobError::Business("no start".into())))).await;
        enqueue(&queue, &SessionJobMessage::new("s1").encode()).await;

        let outcome = worker.process_one(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, Some(Outcome::Rejected(_))));
        assert_eq!(queue.depth("jobs").await.unwrap(), 0);

        let s = store.session("s1").await.unwrap().unwrap();
        assert_eq!(s.event_correction_status, ProcessingStatus::Failed);
        // rolled back
        assert_eq!(s.link_status, ProcessingStatus::Pending);
    }

    #[tokio::test]
    async fn test_permanent_failures_ack_and_mark_failed() {
        let failures: [JobError; 2] = [
            StoreError::Decode("onset is not a number".into()).into(),
            ObjectStoreError::Status(reqwest::StatusCode::FORBIDDEN).into(),
        ];
        for failure in failures {
            let (worker, queue, store) = setup(Arc::new(FailingJob(failure))).await;
            enqueue(&queue, &SessionJobMessage::new("s1").encode()).await;

            let outcome = worker.process_one(&CancellationToken::new()).await.unwrap();
            assert!(matches!(outcome, Some(Outcome::Discarded(_))), "{outcome:?}");
            assert_eq!(queue.depth("jobs").await.unwrap(), 0);
            assert!(queue.dead_letters("jobs").is_empty());

            let s = store.session("s1").await.unwrap().unwrap();
            assert_eq!(s.event_correction_status, ProcessingStatus::Failed);
            assert_eq!(s.link_status, ProcessingStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_then_dead_letters() {
        let (worker, queue, store) =
            setup(Arc::new(FailingJob(JobError::Transient("db blip".into())))).await;
        let worker = worker.with_max_redeliveries(Some(1));
        enqueue(&queue, &SessionJobMessage::new("s1").encode()).await;
        let cancel = CancellationToken::new();

        let first = worker.process_one(&cancel).await.unwrap();
        assert!(matches!(first, Some(Outcome::Requeued(_))));
        assert_eq!(queue.depth("jobs").await.unwrap(), 1);
        let s = store.session("s1").await.unwrap().unwrap();
        assert_eq!(s.event_correction_status, ProcessingStatus::Failed);

        let second = worker.process_one(&cancel).await.unwrap();
        assert!(matches!(second, Some(Outcome::DeadLettered(_))));
        assert_eq!(queue.depth("jobs").await.unwrap(), 0);
        assert_eq!(queue.dead_letters("jobs").len(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_redelivery_by_default() {
        let (worker, queue, _) =
            setup(Arc::new(FailingJob(JobError::Transient("db blip".into())))).await;
        enqueue(&queue, &SessionJobMessage::new("s1").encode()).await;
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            let outcome = worker.process_one(&cancel).await.unwrap();
            assert!(matches!(outcome, Some(Outcome::Requeued(_))));
        }
        assert!(queue.dead_letters("jobs").is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_requeued() {
        let (worker, queue, store) = setup(Arc::new(LinkJob::default())).await;
        enqueue(&queue, &SessionJobMessage::new("s1").encode()).await;
        store.set_unavailable(true);

        let outcome = worker.process_one(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, Some(Outcome::Requeued(_))));
        assert_eq!(queue.depth("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (worker, _, _) = setup(Arc::new(LinkJob::default())).await;
        let worker = worker.with_poll_interval(std::time::Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

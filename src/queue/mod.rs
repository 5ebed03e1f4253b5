//! Durable job queues
//!
//! One queue per job kind. Messages are claimed one at a time, then either
//! acknowledged (removed), negatively acknowledged (made visible again) or
//! dead-lettered (kept for audit, never redelivered).
//!
//! [`BrokerClient`] wraps a [`QueueBackend`] and owns the connection state
//! and reconnect loop, so workers only see "connected" or "reconnecting".

mod memory;
mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::{Backoff, ConnectionState};

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("shutdown requested")]
    Cancelled,
}

impl QueueError {
    /// True when the broker link is down and the client should reconnect.
    pub fn is_connection(&self) -> bool {
        match self {
            QueueError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            QueueError::Unavailable(_) => true,
            QueueError::Cancelled => false,
        }
    }
}

/// A claimed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub queue: String,
    pub body: Vec<u8>,
    /// How many times this message has been handed out, this delivery included
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Broker operations.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Durably enqueue a message.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<i64, QueueError>;

    /// Claim the next visible message, if any.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    /// Remove a processed (or discarded) message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Release a message for redelivery.
    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    /// Park a message permanently.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    /// Messages waiting or in flight, dead letters excluded.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    /// Cheap round trip used to check a recovered connection.
    async fn ping(&self) -> Result<(), QueueError>;

    fn backend_name(&self) -> &'static str;
}

/// Long-lived broker client with reconnect state.
pub struct BrokerClient {
    backend: Arc<dyn QueueBackend>,
    state: Mutex<ConnectionState>,
    backoff: Mutex<Backoff>,
    reconnections: std::sync::atomic::AtomicU64,
}

impl BrokerClient {
    pub fn new(backend: Arc<dyn QueueBackend>, backoff: Backoff) -> Self {
        Self {
            backend,
            state: Mutex::new(ConnectionState::Connected),
            backoff: Mutex::new(backoff),
            reconnections: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or(ConnectionState::Reconnecting)
    }

    /// Total successful reconnects since startup
    pub fn reconnections(&self) -> u64 {
        self.reconnections.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                info!(backend = self.backend.backend_name(), state = next.as_str(), "Broker state changed");
                *state = next;
            }
        }
    }

    fn observe<T>(&self, result: &Result<T, QueueError>) {
        if let Err(e) = result {
            if e.is_connection() {
                self.set_state(ConnectionState::Reconnecting);
            }
        }
    }

    pub async fn publish(&self, queue: &str, body: &[u8]) -> Result<i64, QueueError> {
        let result = self.backend.publish(queue, body).await;
        self.observe(&result);
        result
    }

    pub async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let result = self.backend.fetch(queue).await;
        self.observe(&result);
        result
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = self.backend.ack(delivery).await;
        self.observe(&result);
        result
    }

    pub async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let result = self.backend.nack(delivery, reason).await;
        self.observe(&result);
        result
    }

    pub async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let result = self.backend.dead_letter(delivery, reason).await;
        self.observe(&result);
        result
    }

    pub async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let result = self.backend.depth(queue).await;
        self.observe(&result);
        result
    }

    /// Wait out the backoff and ping until the broker answers again.
    ///
    /// Retries without limit; returns `Err(Cancelled)` only on shutdown.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.set_state(ConnectionState::Reconnecting);
        loop {
            let (delay, attempt) = match self.backoff.lock() {
                Ok(mut b) => (b.next_delay(), b.failures()),
                Err(_) => (Duration::from_secs(1), 0),
            };
            warn!(
                backend = self.backend.backend_name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Broker reconnecting after failure"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.backend.ping().await {
                Ok(()) => {
                    if let Ok(mut b) = self.backoff.lock() {
                        b.reset();
                    }
                    let total = self
                        .reconnections
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                        + 1;
                    self.set_state(ConnectionState::Connected);
                    info!(attempt, total_reconnections = total, "Broker reconnection successful");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Broker still unreachable");
                }
            }
        }
    }

    /// Publish, reconnecting through connection failures until it succeeds or
    /// shutdown is requested.
    pub async fn publish_reliably(
        &self,
        queue: &str,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<i64, QueueError> {
        loop {
            match self.publish(queue, body).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_connection() => {
                    warn!(queue, error = %e, "Publish failed, reconnecting");
                    self.reconnect(cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn test_connection_error_flips_state() {
        let queue = Arc::new(MemoryQueue::new());
        let broker = BrokerClient::new(queue.clone(), fast_backoff());
        assert_eq!(broker.state(), ConnectionState::Connected);

        queue.set_unavailable(true);
        assert!(broker.fetch("q").await.is_err());
        assert_eq!(broker.state(), ConnectionState::Reconnecting);

        queue.set_unavailable(false);
        broker.reconnect(&CancellationToken::new()).await.unwrap();
        assert_eq!(broker.state(), ConnectionState::Connected);
        assert_eq!(broker.reconnections(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_honours_cancellation() {
        let queue = Arc::new(MemoryQueue::new());
        queue.set_unavailable(true);
        let broker = BrokerClient::new(queue, fast_backoff());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(broker.reconnect(&cancel).await, Err(QueueError::Cancelled)));
    }

    #[tokio::test]
    async fn test_publish_reliably_survives_outage() {
        let queue = Arc::new(MemoryQueue::new());
        queue.fail_next(2);
        let broker = BrokerClient::new(queue.clone(), fast_backoff());
        broker
            .publish_reliably("q", b"{}", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(queue.depth("q").await.unwrap(), 1);
        assert!(broker.reconnections() >= 1);
    }
}

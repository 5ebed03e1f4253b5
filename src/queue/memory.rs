//! In-process queue for tests and dry runs. Not durable.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use super::{Delivery, QueueBackend, QueueError};

#[derive(Debug, Clone)]
struct StoredMessage {
    queue: String,
    body: Vec<u8>,
    delivery_count: u32,
    claimed: bool,
    dead_letter: Option<String>,
}

#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<BTreeMap<i64, StoredMessage>>,
    next_id: Mutex<i64>,
    unavailable: AtomicBool,
    failures_left: AtomicU32,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with a connection error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory queue marked unavailable".into()));
        }
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(QueueError::Unavailable("injected broker failure".into()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<i64, StoredMessage>>, QueueError> {
        self.messages
            .lock()
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    /// Bodies of dead-lettered messages with their reasons.
    pub fn dead_letters(&self, queue: &str) -> Vec<(Vec<u8>, String)> {
        self.lock()
            .map(|messages| {
                messages
                    .values()
                    .filter(|m| m.queue == queue)
                    .filter_map(|m| m.dead_letter.clone().map(|r| (m.body.clone(), r)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bodies of live messages, claimed or not.
    pub fn bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .map(|messages| {
                messages
                    .values()
                    .filter(|m| m.queue == queue && m.dead_letter.is_none())
                    .map(|m| m.body.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<i64, QueueError> {
        self.check()?;
        let id = {
            let mut next = self
                .next_id
                .lock()
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
            *next += 1;
            *next
        };
        self.lock()?.insert(
            id,
            StoredMessage {
                queue: queue.to_string(),
                body: body.to_vec(),
                delivery_count: 0,
                claimed: false,
                dead_letter: None,
            },
        );
        Ok(id)
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        self.check()?;
        let mut messages = self.lock()?;
        let next = messages
            .iter_mut()
            .find(|(_, m)| m.queue == queue && !m.claimed && m.dead_letter.is_none());
        Ok(next.map(|(id, m)| {
            m.claimed = true;
            m.delivery_count += 1;
            Delivery {
                id: *id,
                queue: m.queue.clone(),
                body: m.body.clone(),
                delivery_count: m.delivery_count,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.check()?;
        let mut messages = self.lock()?;
        if messages
            .get(&delivery.id)
            .is_some_and(|m| m.delivery_count == delivery.delivery_count)
        {
            messages.remove(&delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, _reason: &str) -> Result<(), QueueError> {
        self.check()?;
        if let Some(m) = self.lock()?.get_mut(&delivery.id) {
            if m.delivery_count == delivery.delivery_count {
                m.claimed = false;
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        self.check()?;
        if let Some(m) = self.lock()?.get_mut(&delivery.id) {
            if m.delivery_count == delivery.delivery_count {
                m.claimed = false;
                m.dead_letter = Some(reason.to_string());
            }
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        self.check()?;
        Ok(self
            .lock()?
            .values()
            .filter(|m| m.queue == queue && m.dead_letter.is_none())
            .count() as u64)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check()
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_ack_nack_cycle() {
        let q = MemoryQueue::new();
        q.publish("a", b"1").await.unwrap();
        q.publish("a", b"2").await.unwrap();
        q.publish("b", b"x").await.unwrap();

        let first = q.fetch("a").await.unwrap().unwrap();
        assert_eq!(first.body, b"1");
        let second = q.fetch("a").await.unwrap().unwrap();
        assert_eq!(second.body, b"2");
        assert!(q.fetch("a").await.unwrap().is_none());

        q.nack(&first, "retry").await.unwrap();
        let again = q.fetch("a").await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_count, 2);
        assert!(again.is_redelivery());

        q.ack(&again).await.unwrap();
        q.dead_letter(&second, "gave up").await.unwrap();
        assert_eq!(q.depth("a").await.unwrap(), 0);
        assert_eq!(q.dead_letters("a"), vec![(b"2".to_vec(), "gave up".to_string())]);
        assert_eq!(q.depth("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_delivery_cannot_settle_newer_claim() {
        let q = MemoryQueue::new();
        q.publish("a", b"1").await.unwrap();
        let stale = q.fetch("a").await.unwrap().unwrap();
        q.nack(&stale, "retry").await.unwrap();
        let current = q.fetch("a").await.unwrap().unwrap();

        q.dead_letter(&stale, "gave up").await.unwrap();
        q.ack(&stale).await.unwrap();
        assert!(q.dead_letters("a").is_empty());
        assert_eq!(q.depth("a").await.unwrap(), 1);

        q.dead_letter(&current, "gave up").await.unwrap();
        assert_eq!(q.dead_letters("a").len(), 1);
        assert_eq!(q.depth("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_connection_errors() {
        let q = MemoryQueue::new();
        q.fail_next(1);
        let err = q.fetch("a").await.unwrap_err();
        assert!(err.is_connection());
        assert!(q.fetch("a").await.unwrap().is_none());
    }
}

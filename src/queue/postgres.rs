//! PostgreSQL-backed durable queue
//!
//! Uses `SELECT FOR UPDATE SKIP LOCKED` so any number of workers can claim
//! their own message without stepping on each other. A claimed message that
//! is neither acked nor nacked within the visibility timeout is handed out
//! again, which covers workers that died mid-job.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::warn;

use super::{Delivery, QueueBackend, QueueError};

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl QueueBackend for PgQueue {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<i64, QueueError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO job_messages (queue, body) VALUES ($1, $2) RETURNING id",
        )
        .bind(queue)
        .bind(body)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        // Single atomic UPDATE … RETURNING that claims the oldest visible message.
        let row: Option<(i64, String, Vec<u8>, i32)> = sqlx::query_as(
            r#"
            UPDATE job_messages
            SET    claimed_at = NOW(),
                   delivery_count = delivery_count + 1
            WHERE  id = (
                SELECT id
                FROM   job_messages
                WHERE  queue = $1
                  AND  dead_lettered_at IS NULL
                  AND  (claimed_at IS NULL
                        OR claimed_at < NOW() - make_interval(secs => $2))
                ORDER  BY id ASC
                LIMIT  1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, body, delivery_count
            "#,
        )
        .bind(queue)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, queue, body, delivery_count)| Delivery {
            id,
            queue,
            body,
            delivery_count: u32::try_from(delivery_count).unwrap_or(0),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        // delivery_count guards against acking a copy that was already
        // handed to another worker after the visibility timeout.
        let result = sqlx::query("DELETE FROM job_messages WHERE id = $1 AND delivery_count = $2")
            .bind(delivery.id)
            .bind(delivery.delivery_count as i32)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(message_id = delivery.id, "Ack matched no message, it was redelivered elsewhere");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE job_messages \
             SET claimed_at = NULL, last_error = $3 \
             WHERE id = $1 AND delivery_count = $2",
        )
        .bind(delivery.id)
        .bind(delivery.delivery_count as i32)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_messages \
             SET dead_lettered_at = NOW(), claimed_at = NULL, last_error = $3 \
             WHERE id = $1 AND delivery_count = $2",
        )
        .bind(delivery.id)
        .bind(delivery.delivery_count as i32)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(message_id = delivery.id, "Dead-letter matched no message, it was redelivered elsewhere");
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_messages WHERE queue = $1 AND dead_lettered_at IS NULL",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "PostgreSQL"
    }
}

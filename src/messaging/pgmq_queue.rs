//! # PostgreSQL Work Queue (pgmq)
//!
//! Work queue backed by the pgmq extension. Reads set a visibility timeout; a
//! message that is not acknowledged before it expires becomes visible again and is
//! redelivered with a higher read count. Acknowledgement deletes the message.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{queue_name, Delivery, QueueEnvelope, QueueError, QueueMessage, QueueProvider, WorkQueue};
use crate::constants::Stage;
use crate::models::ExecutionId;

/// Poll interval used inside `pgmq.read_with_poll`.
const POLL_INTERVAL_MS: i32 = 100;

#[derive(Debug, Clone)]
pub struct PgmqWorkQueue {
    name: String,
    pool: PgPool,
    visibility_timeout_seconds: i32,
}

impl PgmqWorkQueue {
    /// Bind to an existing queue without creating it.
    pub fn new(name: impl Into<String>, pool: PgPool, visibility_timeout_seconds: i32) -> Self {
        Self {
            name: name.into(),
            pool,
            visibility_timeout_seconds,
        }
    }

    /// Create the queue if it does not already exist.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn create(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::operation(&self.name, "create", e.to_string()))?;
        debug!(queue = %self.name, "📋 PGMQ: queue ready");
        Ok(())
    }

    pub async fn drop_queue(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT pgmq.drop_queue($1)")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::operation(&self.name, "drop_queue", e.to_string()))?;
        info!(queue = %self.name, "🗑️ PGMQ: queue dropped");
        Ok(())
    }

    fn encode(message: QueueMessage) -> Result<serde_json::Value, QueueError> {
        Ok(serde_json::to_value(QueueEnvelope::from(message))?)
    }
}

#[async_trait]
impl WorkQueue for PgmqWorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        let payload = Self::encode(message)?;
        let row = sqlx::query("SELECT pgmq.send($1, $2) AS msg_id")
            .bind(&self.name)
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::operation(&self.name, "send", e.to_string()))?;
        let msg_id: i64 = row.get("msg_id");
        debug!(queue = %self.name, msg_id, "📤 PGMQ: message sent");
        Ok(())
    }

    async fn enqueue_many(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError> {
        if messages.is_empty() {
            return Ok(());
        }
        let payloads = messages
            .into_iter()
            .map(Self::encode)
            .collect::<Result<Vec<_>, _>>()?;
        let count = payloads.len();

        sqlx::query("SELECT pgmq.send_batch($1, $2::jsonb[])")
            .bind(&self.name)
            .bind(payloads)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::operation(&self.name, "send_batch", e.to_string()))?;
        debug!(queue = %self.name, count, "📤 PGMQ: batch sent");
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        // pgmq polls in whole seconds
        let max_poll_seconds = i32::try_from(timeout.as_secs().max(1)).unwrap_or(i32::MAX);

        let row = sqlx::query(
            "SELECT msg_id, read_ct, message FROM pgmq.read_with_poll($1, $2, 1, $3, $4)",
        )
        .bind(&self.name)
        .bind(self.visibility_timeout_seconds)
        .bind(max_poll_seconds)
        .bind(POLL_INTERVAL_MS)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::operation(&self.name, "read_with_poll", e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let msg_id: i64 = row.get("msg_id");
        let read_ct: i32 = row.get("read_ct");
        let body: serde_json::Value = row.get("message");
        let envelope: QueueEnvelope =
            serde_json::from_value(body).map_err(|e| QueueError::MessageDeserialization {
                message: format!("message {msg_id} on {}: {e}", self.name),
            })?;

        if read_ct > 1 {
            warn!(queue = %self.name, msg_id, read_ct, "🔁 PGMQ: redelivering unacknowledged message");
        }

        Ok(Some(Delivery::new(
            envelope.message,
            Some(msg_id),
            u32::try_from(read_ct).unwrap_or(1),
        )))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let Some(msg_id) = delivery.receipt else {
            return Ok(());
        };
        sqlx::query("SELECT pgmq.delete($1, $2::bigint)")
            .bind(&self.name)
            .bind(msg_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::operation(&self.name, "delete", e.to_string()))?;
        Ok(())
    }
}

/// Creates one pgmq queue per (environment, execution, stage) and drops it on release.
#[derive(Debug, Clone)]
pub struct PgmqQueueProvider {
    pool: PgPool,
    visibility_timeout_seconds: i32,
}

impl PgmqQueueProvider {
    pub fn new(pool: PgPool, visibility_timeout_seconds: i32) -> Self {
        Self {
            pool,
            visibility_timeout_seconds,
        }
    }

    pub async fn connect(
        database_url: &str,
        visibility_timeout_seconds: i32,
    ) -> Result<Self, QueueError> {
        info!("🚀 PGMQ: connecting queue provider");
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| QueueError::Unavailable {
                message: e.to_string(),
            })?;
        Ok(Self::new(pool, visibility_timeout_seconds))
    }
}

#[async_trait]
impl QueueProvider for PgmqQueueProvider {
    async fn queue_for(
        &self,
        environment: &str,
        execution_id: &ExecutionId,
        stage: Stage,
    ) -> Result<Arc<dyn WorkQueue>, QueueError> {
        let queue = PgmqWorkQueue::new(
            queue_name(environment, execution_id, stage),
            self.pool.clone(),
            self.visibility_timeout_seconds,
        );
        queue.create().await?;
        Ok(Arc::new(queue))
    }

    async fn release(&self, queue: &dyn WorkQueue) -> Result<(), QueueError> {
        PgmqWorkQueue::new(queue.name(), self.pool.clone(), self.visibility_timeout_seconds)
            .drop_queue()
            .await
    }
}

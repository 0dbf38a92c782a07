//! # Messaging Module
//!
//! Durable, at-least-once FIFO work queues carrying batch references from a
//! dispatcher to its workers.
//!
//! Queues are never looked up globally: a [`QueueProvider`] hands the dispatcher a
//! queue scoped to one execution and one stage, and the dispatcher passes that
//! instance to every worker it spawns.
//!
//! A dequeue that times out is the "drained" signal; the dispatcher additionally
//! enqueues one [`QueueMessage::Poison`] per worker slot after the batches.

pub mod errors;
pub mod in_memory;
pub mod message;
#[cfg(feature = "postgres")]
pub mod pgmq_queue;

pub use errors::QueueError;
pub use in_memory::{InMemoryQueueProvider, InMemoryWorkQueue};
pub use message::{Delivery, QueueEnvelope, QueueMessage};
#[cfg(feature = "postgres")]
pub use pgmq_queue::{PgmqQueueProvider, PgmqWorkQueue};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::Stage;
use crate::models::ExecutionId;

/// Longest queue name accepted by pgmq (table names carry a prefix).
pub const MAX_QUEUE_NAME_LEN: usize = 47;

#[async_trait]
pub trait WorkQueue: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError>;

    async fn enqueue_many(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError> {
        for message in messages {
            self.enqueue(message).await?;
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next message. `Ok(None)` means the queue stayed
    /// empty for the whole window.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery so the backend will not hand it out again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// Creates queues scoped to an execution and stage.
#[async_trait]
pub trait QueueProvider: Send + Sync + fmt::Debug {
    async fn queue_for(
        &self,
        environment: &str,
        execution_id: &ExecutionId,
        stage: Stage,
    ) -> Result<Arc<dyn WorkQueue>, QueueError>;

    /// Release backend resources once a stage has finished with its queue.
    async fn release(&self, _queue: &dyn WorkQueue) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Deterministic queue name for an execution's stage.
///
/// Lowercase ASCII alphanumerics and underscores only. Names that would exceed
/// [`MAX_QUEUE_NAME_LEN`] are truncated and suffixed with a hash of the full name
/// so distinct executions keep distinct queues.
pub fn queue_name(environment: &str, execution_id: &ExecutionId, stage: Stage) -> String {
    let raw = format!("bf_{environment}_{execution_id}_{}", stage.as_str());
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.len() <= MAX_QUEUE_NAME_LEN {
        return sanitized;
    }

    let suffix = format!("_{:08x}", fnv1a32(raw.as_bytes()));
    let keep = MAX_QUEUE_NAME_LEN - suffix.len();
    format!("{}{suffix}", &sanitized[..keep])
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(0x0100_0193)
    })
}

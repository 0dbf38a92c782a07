//! # Queue Messages
//!
//! What travels through a stage's work queue: batch references, and the poison
//! value a dispatcher enqueues once per worker slot to request a graceful exit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::BatchReference;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum QueueMessage {
    Batch(BatchReference),
    Poison,
}

impl QueueMessage {
    pub fn is_poison(&self) -> bool {
        matches!(self, QueueMessage::Poison)
    }
}

/// Envelope persisted by queue backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub message: QueueMessage,
    pub enqueued_at: DateTime<Utc>,
}

impl From<QueueMessage> for QueueEnvelope {
    fn from(message: QueueMessage) -> Self {
        Self {
            message,
            enqueued_at: Utc::now(),
        }
    }
}

/// A dequeued message plus whatever the backend needs to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    /// Backend message id; `None` for backends without acknowledgement.
    pub receipt: Option<i64>,
    /// How many times this message has been handed out, including this one.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn new(message: QueueMessage, receipt: Option<i64>, delivery_count: u32) -> Self {
        Self {
            message,
            receipt,
            delivery_count,
        }
    }

    /// True when the backend is handing out a message a previous consumer never
    /// acknowledged.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

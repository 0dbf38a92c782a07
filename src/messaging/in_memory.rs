//! # In-Memory Work Queue
//!
//! Process-local FIFO with blocking dequeue. Delivery is exactly-once in practice,
//! which satisfies the at-least-once contract; unacknowledged deliveries are
//! tracked so tests can assert that workers acknowledge what they claim.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{queue_name, Delivery, QueueError, QueueMessage, QueueProvider, WorkQueue};
use crate::constants::Stage;
use crate::models::ExecutionId;

#[derive(Debug)]
pub struct InMemoryWorkQueue {
    name: String,
    pending: Mutex<VecDeque<(i64, QueueMessage)>>,
    in_flight: DashMap<i64, QueueMessage>,
    next_id: AtomicI64,
    notify: Notify,
}

impl InMemoryWorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            next_id: AtomicI64::new(1),
            notify: Notify::new(),
        }
    }

    /// Messages waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Deliveries handed out but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.in_flight.len()
    }

    /// Discard pending and unacknowledged messages, returning how many were dropped.
    pub fn purge(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock()).len();
        let in_flight = self.in_flight.len();
        self.in_flight.clear();
        pending + in_flight
    }

    fn pop(&self) -> Option<Delivery> {
        let (id, message) = self.pending.lock().pop_front()?;
        self.in_flight.insert(id, message.clone());
        Some(Delivery::new(message, Some(id), 1))
    }

    fn push(&self, message: QueueMessage) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back((id, message));
        self.notify.notify_one();
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.push(message);
        Ok(())
    }

    async fn enqueue_many(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError> {
        let count = messages.len();
        for message in messages {
            self.push(message);
        }
        debug!(queue = %self.name, count, "QUEUE: enqueued messages");
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.pop() {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if let Some(id) = delivery.receipt {
            self.in_flight.remove(&id);
        }
        Ok(())
    }
}

/// Hands out one in-memory queue per (environment, execution, stage).
///
/// Asking twice for the same scope returns the same queue until it is released.
/// Releasing removes the queue and purges whatever a dispatch left behind, so a
/// rerun of the same stage starts from an empty queue.
#[derive(Debug, Default)]
pub struct InMemoryQueueProvider {
    queues: DashMap<String, Arc<InMemoryWorkQueue>>,
}

impl InMemoryQueueProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<InMemoryWorkQueue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }
}

#[async_trait]
impl QueueProvider for InMemoryQueueProvider {
    async fn queue_for(
        &self,
        environment: &str,
        execution_id: &ExecutionId,
        stage: Stage,
    ) -> Result<Arc<dyn WorkQueue>, QueueError> {
        let name = queue_name(environment, execution_id, stage);
        let queue = self
            .queues
            .entry(name.clone())
            .or_insert_with(|| Arc::new(InMemoryWorkQueue::new(name)))
            .clone();
        Ok(queue)
    }

    async fn release(&self, queue: &dyn WorkQueue) -> Result<(), QueueError> {
        if let Some((name, queue)) = self.queues.remove(queue.name()) {
            let dropped = queue.purge();
            debug!(queue = %name, dropped, "🧹 QUEUE: released in-memory queue");
        }
        Ok(())
    }
}

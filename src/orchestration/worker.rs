//! # Stage Worker
//!
//! A worker drains one stage's work queue until it sees a poison message or the
//! queue stays empty for a full dequeue timeout.
//!
//! ```text
//! Idle -> Fetching -> Processing -> Writing -> Idle
//!            |
//!            +-> Done   (poison or dequeue timeout)
//! ```
//!
//! Failure handling per level:
//!
//! - an item that fails its processor (after retries) becomes an error-tagged row
//!   in `batch_{n}_errors.json` and the batch continues;
//! - a batch whose input cannot be loaded or whose output cannot be written is a
//!   batch error: logged, counted against all of its items, and the worker moves
//!   on to the next message.
//!
//! A claimed batch always runs to completion before the worker looks at the queue
//! again. Every message is acknowledged once handled, success or not; failed
//! batches are gaps in consolidation, never retried in place.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BatchflowConfig;
use crate::constants::{error_fields, Stage};
use crate::error::{BatchflowError, ItemError, Result};
use crate::logging::log_batch_operation;
use crate::messaging::{Delivery, QueueMessage, WorkQueue};
use crate::models::{BatchReference, Record};
use crate::orchestration::processor::{ItemOutput, StageProcessor};
use crate::orchestration::scheduler::panic_message;
use crate::resilience::{RetryOutcome, RetryPolicy};
use crate::storage::{DurableStore, RecordStoreExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Fetching,
    Processing,
    Writing,
    Done,
}

/// Totals a worker reports when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_id: String,
    /// Input items whose processor invocation succeeded.
    pub processed_items: usize,
    /// Failed items plus every item of a failed batch.
    pub error_items: usize,
    /// Rows written to batch outputs (differs from `processed_items` on fan-out).
    pub output_records: usize,
    pub completed_batches: Vec<u32>,
    pub failed_batches: Vec<u32>,
}

impl WorkerReport {
    pub fn batches_completed(&self) -> usize {
        self.completed_batches.len()
    }

    /// Whether this worker handled `batch_number`, successfully or not.
    pub fn handled(&self, batch_number: u32) -> bool {
        self.completed_batches.contains(&batch_number) || self.failed_batches.contains(&batch_number)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub dequeue_timeout: Duration,
    pub item_timeout: Duration,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn for_stage(config: &BatchflowConfig, stage: Stage) -> Self {
        Self {
            dequeue_timeout: config.worker.dequeue_timeout(),
            item_timeout: config.stages.get(stage).item_timeout(),
            retry: config.retry.clone(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_secs(5),
            item_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BatchOutcome {
    succeeded: usize,
    failed: usize,
    records_written: usize,
}

#[derive(Debug)]
pub struct StageWorker {
    id: String,
    stage: Stage,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn DurableStore>,
    processor: Arc<dyn StageProcessor>,
    settings: WorkerSettings,
    state: WorkerState,
    report: WorkerReport,
}

impl StageWorker {
    pub fn new(
        id: impl Into<String>,
        stage: Stage,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn DurableStore>,
        processor: Arc<dyn StageProcessor>,
        settings: WorkerSettings,
    ) -> Self {
        let id = id.into();
        Self {
            report: WorkerReport {
                worker_id: id.clone(),
                ..WorkerReport::default()
            },
            id,
            stage,
            queue,
            store,
            processor,
            settings,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Drain the queue and report totals. Only a queue failure ends the worker
    /// with an error; batch and item failures are counted in the report.
    #[instrument(skip_all, fields(worker_id = %self.id, stage = %self.stage))]
    pub async fn run(mut self) -> Result<WorkerReport> {
        info!(processor = self.processor.name(), "👷 WORKER: started");

        loop {
            self.transition(WorkerState::Fetching);
            let Some(delivery) = self.queue.dequeue(self.settings.dequeue_timeout).await? else {
                debug!("👷 WORKER: queue drained");
                break;
            };

            let batch = match &delivery.message {
                QueueMessage::Poison => {
                    debug!("☠️ WORKER: poison received");
                    self.ack(&delivery).await;
                    break;
                }
                QueueMessage::Batch(batch) => batch.clone(),
            };

            if delivery.is_redelivery() {
                warn!(
                    batch_number = batch.batch_number,
                    delivery_count = delivery.delivery_count,
                    "🔁 WORKER: processing redelivered batch"
                );
            }

            match self.process_batch(&batch).await {
                Ok(outcome) => {
                    self.report.processed_items += outcome.succeeded;
                    self.report.error_items += outcome.failed;
                    self.report.output_records += outcome.records_written;
                    self.report.completed_batches.push(batch.batch_number);
                    log_batch_operation(
                        "process_batch",
                        batch.execution_id.as_str(),
                        batch.stage,
                        batch.batch_number,
                        "completed",
                        Some(&format!(
                            "succeeded={} failed={} written={}",
                            outcome.succeeded, outcome.failed, outcome.records_written
                        )),
                    );
                }
                Err(e) => {
                    error!(
                        batch_number = batch.batch_number,
                        item_count = batch.item_count,
                        error = %e,
                        "❌ WORKER: batch failed, contributing zero rows"
                    );
                    self.report.error_items += batch.item_count;
                    self.report.failed_batches.push(batch.batch_number);
                    log_batch_operation(
                        "process_batch",
                        batch.execution_id.as_str(),
                        batch.stage,
                        batch.batch_number,
                        "failed",
                        Some(&e.to_string()),
                    );
                }
            }

            self.ack(&delivery).await;
            self.transition(WorkerState::Idle);
        }

        self.transition(WorkerState::Done);
        info!(
            processed_items = self.report.processed_items,
            error_items = self.report.error_items,
            batches_completed = self.report.batches_completed(),
            batches_failed = self.report.failed_batches.len(),
            "👷 WORKER: finished"
        );
        Ok(self.report)
    }

    async fn process_batch(&mut self, batch: &BatchReference) -> Result<BatchOutcome> {
        self.transition(WorkerState::Processing);

        let items = self
            .store
            .get_records(&batch.input_location)
            .await
            .map_err(|e| {
                BatchflowError::batch(
                    batch.stage,
                    batch.batch_number,
                    batch.item_count,
                    format!("failed to load input: {e}"),
                )
            })?;

        let mut output = Vec::with_capacity(items.len());
        let mut error_rows = Vec::new();
        let mut succeeded = 0;

        for (index, record) in items.iter().enumerate() {
            let outcome = self.process_item(record).await;
            match outcome.result {
                Ok(item_output) => {
                    succeeded += 1;
                    output.extend(item_output.into_records());
                }
                Err(item_error) => {
                    warn!(
                        batch_number = batch.batch_number,
                        item_index = index,
                        attempts = outcome.attempts,
                        error = %item_error,
                        "⚠️ WORKER: item failed"
                    );
                    error_rows.push(error_row(
                        batch.batch_number,
                        index,
                        &item_error,
                        outcome.attempts,
                        record,
                    ));
                }
            }
        }

        self.transition(WorkerState::Writing);

        self.store
            .put_records(&batch.output_location, &output)
            .await
            .map_err(|e| {
                BatchflowError::batch(
                    batch.stage,
                    batch.batch_number,
                    batch.item_count,
                    format!("failed to write output: {e}"),
                )
            })?;

        if !error_rows.is_empty() {
            if let Err(e) = self
                .store
                .put_records(&batch.errors_location(), &error_rows)
                .await
            {
                warn!(
                    batch_number = batch.batch_number,
                    error = %e,
                    "⚠️ WORKER: failed to write error rows"
                );
            }
        }

        Ok(BatchOutcome {
            succeeded,
            failed: error_rows.len(),
            records_written: output.len(),
        })
    }

    /// One processor invocation under the retry policy, each attempt bounded by the
    /// item timeout. Panics inside the processor become permanent item errors.
    async fn process_item(&self, record: &Record) -> RetryOutcome<ItemOutput> {
        let processor = &self.processor;
        let item_timeout = self.settings.item_timeout;

        self.settings
            .retry
            .run(|_attempt| async move {
                let attempt = AssertUnwindSafe(processor.process(record)).catch_unwind();
                match tokio::time::timeout(item_timeout, attempt).await {
                    Err(_) => Err(ItemError::retryable(format!(
                        "processor timed out after {item_timeout:?}"
                    ))),
                    Ok(Err(panic)) => Err(ItemError::permanent(format!(
                        "processor panicked: {}",
                        panic_message(panic)
                    ))),
                    Ok(Ok(result)) => result,
                }
            })
            .await
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            warn!(error = %e, "⚠️ WORKER: failed to acknowledge message");
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "👷 WORKER: state transition");
            self.state = next;
        }
    }
}

fn error_row(
    batch_number: u32,
    item_index: usize,
    error: &ItemError,
    attempts: u32,
    record: &Record,
) -> Record {
    let mut row = Record::new();
    row.insert(error_fields::BATCH_NUMBER.to_string(), json!(batch_number));
    row.insert(error_fields::ITEM_INDEX.to_string(), json!(item_index));
    row.insert(error_fields::ERROR.to_string(), json!(error.message));
    row.insert(error_fields::ATTEMPTS.to_string(), json!(attempts));
    row.insert(error_fields::RECORD.to_string(), Value::Object(record.clone()));
    row
}

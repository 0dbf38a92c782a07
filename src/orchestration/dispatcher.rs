//! # Stage Dispatcher
//!
//! Runs one stage end to end:
//!
//! ```text
//! read input -> plan -> materialize -> enqueue (+ poison per worker)
//!            -> spawn workers -> join (bounded by stage timeout)
//!            -> consolidate -> release queue -> StageResult
//! ```
//!
//! Stage-level outcomes, including failures, come back as a [`StageResult`]:
//! missing or empty input and an empty consolidation yield
//! [`StageStatus::Failed`] with the reason in `error`. `Err` is reserved for
//! infrastructure failures (store reads, queue creation, enqueue) that leave the
//! stage unable to report at all.
//!
//! Worker failures are isolated. A worker that panics, fails or overruns the stage
//! timeout contributes no report; any batch it left without output is counted in
//! `error_count` by item count.

use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BatchflowConfig;
use crate::constants::{Stage, StageStatus};
use crate::error::{BatchflowError, Result};
use crate::logging::log_stage_operation;
use crate::messaging::{QueueMessage, QueueProvider, WorkQueue};
use crate::models::{field_distribution, BatchReference, ExecutionId, RecordSet, StageResult};
use crate::orchestration::batch_materializer::BatchMaterializer;
use crate::orchestration::batch_planner::BatchPlanner;
use crate::orchestration::consolidator::Consolidator;
use crate::orchestration::processor::ProcessorRegistry;
use crate::orchestration::scheduler::{TaskHandle, TaskScheduler};
use crate::orchestration::worker::{StageWorker, WorkerReport, WorkerSettings};
use crate::storage::{DurableStore, RecordStoreExt, StoreKey};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Truncate the stage input to at most this many records before planning.
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct StageDispatcher {
    store: Arc<dyn DurableStore>,
    queues: Arc<dyn QueueProvider>,
    scheduler: Arc<dyn TaskScheduler>,
    processors: Arc<ProcessorRegistry>,
    config: Arc<BatchflowConfig>,
    planner: BatchPlanner,
    materializer: BatchMaterializer,
    consolidator: Consolidator,
}

/// Where a stage reads its input: the seed for discovery, otherwise the previous
/// stage's consolidated output.
pub fn input_location(environment: &str, execution_id: &ExecutionId, stage: Stage) -> StoreKey {
    match stage.previous() {
        Some(previous) => StoreKey::stage_output(environment, execution_id, previous),
        None => StoreKey::seed_input(environment, execution_id),
    }
}

impl StageDispatcher {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queues: Arc<dyn QueueProvider>,
        scheduler: Arc<dyn TaskScheduler>,
        processors: Arc<ProcessorRegistry>,
        config: Arc<BatchflowConfig>,
    ) -> Self {
        Self {
            planner: BatchPlanner::new(config.planner.clone()),
            materializer: BatchMaterializer::new(Arc::clone(&store)),
            consolidator: Consolidator::new(Arc::clone(&store)),
            store,
            queues,
            scheduler,
            processors,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<BatchflowConfig> {
        &self.config
    }

    #[instrument(skip(self, options), fields(execution_id = %execution_id, stage = %stage, environment = %environment))]
    pub async fn run_stage(
        &self,
        stage: Stage,
        environment: &str,
        execution_id: &ExecutionId,
        options: DispatchOptions,
    ) -> Result<StageResult> {
        StoreKey::validate_environment(environment)?;
        let started = Instant::now();
        let settings = self.config.stages.get(stage);
        let deadline = TokioInstant::now() + settings.stage_timeout();

        log_stage_operation("dispatch", execution_id.as_str(), stage, "started", None, None);

        let input_key = input_location(environment, execution_id, stage);
        let mut items: RecordSet = match self.store.get_records(&input_key).await {
            Ok(items) => items,
            Err(e) if e.is_not_found() => {
                return Ok(self.failed(
                    execution_id,
                    stage,
                    started,
                    format!("no input found at {input_key}"),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        if items.is_empty() {
            return Ok(self.failed(
                execution_id,
                stage,
                started,
                format!("input at {input_key} is empty"),
            ));
        }

        if let Some(max_items) = options.max_items {
            if items.len() > max_items {
                info!(
                    available = items.len(),
                    max_items,
                    "✂️ DISPATCHER: truncating stage input"
                );
                items.truncate(max_items);
            }
        }

        let input_count = items.len();
        let plan = self.planner.plan_for_stage(input_count, settings);
        info!(
            input_count,
            batch_size = plan.batch_size,
            batch_count = plan.batch_count,
            max_workers = plan.max_workers,
            "📐 DISPATCHER: stage planned"
        );

        let materialized = with_deadline(
            deadline,
            settings.stage_timeout(),
            "materialize",
            self.materializer
                .materialize(&items, plan.batch_size, execution_id, stage, environment),
        )
        .await?;
        drop(items);

        if materialized.batches.is_empty() {
            let mut result = self.failed(
                execution_id,
                stage,
                started,
                "no batch input could be written",
            );
            result.input_count = input_count;
            result.error_count = materialized.failed_items;
            result.failed_batches = materialized.failed_batches;
            result.materialization_failures = result.error_count;
            return Ok(result);
        }

        let worker_count = plan.max_workers.min(materialized.batches.len()).max(1);
        let queue = self.queues.queue_for(environment, execution_id, stage).await?;

        let mut messages: Vec<QueueMessage> = materialized
            .batches
            .iter()
            .cloned()
            .map(QueueMessage::Batch)
            .collect();
        messages.extend(std::iter::repeat(QueueMessage::Poison).take(worker_count));

        if let Err(e) = with_deadline(deadline, settings.stage_timeout(), "enqueue", async {
            queue.enqueue_many(messages).await.map_err(BatchflowError::from)
        })
        .await
        {
            self.release(queue.as_ref()).await;
            return Err(e);
        }
        debug!(
            queue = queue.name(),
            batches = materialized.batches.len(),
            poison = worker_count,
            "📤 DISPATCHER: batches enqueued"
        );

        let handles = self.spawn_workers(stage, execution_id, &queue, worker_count);
        let (reports, worker_failures) = join_workers(handles, deadline).await;

        let output_location = StoreKey::stage_output(environment, execution_id, stage);
        let consolidation = self
            .consolidator
            .consolidate(&materialized.batches, &output_location)
            .await;
        self.release(queue.as_ref()).await;
        let consolidation = consolidation?;

        // batches missing from consolidation that no surviving worker accounted for
        let mut failed_batches: BTreeSet<u32> = materialized.failed_batches.iter().copied().collect();
        let mut unaccounted_items = 0;
        for report in &reports {
            failed_batches.extend(report.failed_batches.iter().copied());
        }
        for batch_number in &consolidation.missing_batches {
            failed_batches.insert(*batch_number);
            if !reports.iter().any(|r| r.handled(*batch_number)) {
                unaccounted_items += item_count(&materialized.batches, *batch_number);
            }
        }
        // consolidated batches whose worker was aborted before reporting
        if worker_failures > 0 {
            for batch in &materialized.batches {
                if consolidation.missing_batches.contains(&batch.batch_number)
                    || reports.iter().any(|r| r.handled(batch.batch_number))
                {
                    continue;
                }
                unaccounted_items += self.recorded_errors(batch).await;
            }
        }

        let worker_errors: usize = reports.iter().map(|r| r.error_items).sum();
        let error_count = worker_errors + materialized.failed_items + unaccounted_items;
        let processed_count = consolidation.record_count();

        let (status, error) = if consolidation.records.is_empty() {
            (
                StageStatus::Failed,
                Some("no records were consolidated".to_string()),
            )
        } else {
            (StageStatus::Completed, None)
        };

        let distribution = settings
            .summary_field
            .as_deref()
            .filter(|_| status == StageStatus::Completed)
            .map(|field| field_distribution(&consolidation.records, field));

        let result = StageResult {
            execution_id: execution_id.clone(),
            stage,
            status,
            input_count,
            processed_count,
            error_count,
            batch_count: materialized.batches.len() + materialized.failed_batches.len(),
            worker_count,
            failed_batches: failed_batches.into_iter().collect(),
            materialization_failures: materialized.failed_items,
            output_location: consolidation.written.then_some(output_location),
            distribution,
            duration_ms: elapsed_ms(started),
            error,
        };

        if worker_failures > 0 {
            warn!(worker_failures, "⚠️ DISPATCHER: some workers did not report");
        }
        log_stage_operation(
            "dispatch",
            execution_id.as_str(),
            stage,
            &result.status.to_string(),
            Some(processed_count),
            Some(&format!(
                "errors={} batches={} workers={}",
                result.error_count, result.batch_count, result.worker_count
            )),
        );

        Ok(result)
    }

    fn spawn_workers(
        &self,
        stage: Stage,
        execution_id: &ExecutionId,
        queue: &Arc<dyn WorkQueue>,
        worker_count: usize,
    ) -> Vec<Box<dyn TaskHandle>> {
        let processor = self.processors.get(stage);
        let settings = WorkerSettings::for_stage(&self.config, stage);

        (0..worker_count)
            .map(|index| {
                let worker_id = format!("{execution_id}-{stage}-worker-{index}");
                let worker = StageWorker::new(
                    worker_id.clone(),
                    stage,
                    Arc::clone(queue),
                    Arc::clone(&self.store),
                    Arc::clone(&processor),
                    settings.clone(),
                );
                self.scheduler.spawn(worker_id, worker.run().boxed())
            })
            .collect()
    }

    /// Error rows a batch left behind, for batches whose worker never reported.
    async fn recorded_errors(&self, batch: &BatchReference) -> usize {
        match self.store.get_records(&batch.errors_location()).await {
            Ok(rows) => rows.len(),
            Err(e) if e.is_not_found() => 0,
            Err(e) => {
                warn!(
                    batch_number = batch.batch_number,
                    error = %e,
                    "⚠️ DISPATCHER: could not read error rows of unreported batch"
                );
                0
            }
        }
    }

    async fn release(&self, queue: &dyn WorkQueue) {
        if let Err(e) = self.queues.release(queue).await {
            warn!(queue = queue.name(), error = %e, "⚠️ DISPATCHER: failed to release queue");
        }
    }

    fn failed(
        &self,
        execution_id: &ExecutionId,
        stage: Stage,
        started: Instant,
        reason: impl Into<String>,
    ) -> StageResult {
        let reason = reason.into();
        error!(reason = %reason, "❌ DISPATCHER: stage failed");
        log_stage_operation(
            "dispatch",
            execution_id.as_str(),
            stage,
            "failed",
            None,
            Some(&reason),
        );
        let mut result = StageResult::failed(execution_id, stage, reason);
        result.duration_ms = elapsed_ms(started);
        result
    }
}

/// Join every handle against a shared deadline, aborting whatever overruns it.
async fn join_workers(
    handles: Vec<Box<dyn TaskHandle>>,
    deadline: TokioInstant,
) -> (Vec<WorkerReport>, usize) {
    let mut reports = Vec::with_capacity(handles.len());
    let mut failures = 0;

    for mut handle in handles {
        let joined = tokio::time::timeout_at(deadline, handle.join()).await;
        match joined {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => {
                failures += 1;
                error!(task = handle.name(), error = %e, "❌ DISPATCHER: worker failed");
            }
            Err(_) => {
                failures += 1;
                handle.abort();
                error!(task = handle.name(), "⏰ DISPATCHER: worker exceeded stage timeout, aborted");
            }
        }
    }

    (reports, failures)
}

/// Bound `future` by the stage deadline. `timeout` is the configured stage timeout
/// the deadline was derived from.
async fn with_deadline<T>(
    deadline: TokioInstant,
    timeout: std::time::Duration,
    operation: &str,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout_at(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(BatchflowError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

fn item_count(batches: &[BatchReference], batch_number: u32) -> usize {
    batches
        .iter()
        .find(|b| b.batch_number == batch_number)
        .map_or(0, |b| b.item_count)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryQueueProvider;
    use crate::orchestration::scheduler::TokioTaskScheduler;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn config() -> Arc<BatchflowConfig> {
        let mut config = BatchflowConfig::default();
        config.worker.dequeue_timeout_ms = 50;
        Arc::new(config)
    }

    fn dispatcher(store: Arc<MemoryStore>) -> StageDispatcher {
        StageDispatcher::new(
            store,
            Arc::new(InMemoryQueueProvider::new()),
            Arc::new(TokioTaskScheduler::new(16)),
            Arc::new(ProcessorRegistry::new()),
            config(),
        )
    }

    #[test]
    fn test_input_locations() {
        let exec: ExecutionId = "exec_1_00000000".parse().unwrap();
        assert_eq!(
            input_location("dev", &exec, Stage::Discovery).to_string(),
            "dev/exec_1_00000000/discovery/seed_input.json"
        );
        assert_eq!(
            input_location("dev", &exec, Stage::Categorization).to_string(),
            "dev/exec_1_00000000/extraction/extracted_records.json"
        );
    }

    #[tokio::test]
    async fn test_deadline_reports_configured_timeout() {
        let timeout = std::time::Duration::from_millis(50);
        let deadline = TokioInstant::now() + timeout;
        let err = with_deadline(deadline, timeout, "materialize", async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        match err {
            BatchflowError::Timeout { operation, timeout: reported } => {
                assert_eq!(operation, "materialize");
                assert_eq!(reported, timeout);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_environment_is_rejected_before_reading_input() {
        let store = Arc::new(MemoryStore::new());
        let exec = ExecutionId::generate();
        let err = dispatcher(store.clone())
            .run_stage(Stage::Extraction, "eu/prod", &exec, DispatchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BatchflowError::Store(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_input_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let exec = ExecutionId::generate();
        let result = dispatcher(store.clone())
            .run_stage(Stage::Extraction, "test", &exec, DispatchOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.batch_count, 0);
        assert!(result.error.unwrap().contains("no input"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_max_items_truncates_input() {
        let store = Arc::new(MemoryStore::new());
        let exec = ExecutionId::generate();
        let items: Vec<_> = (0..40)
            .map(|i| json!({ "id": i }).as_object().cloned().unwrap())
            .collect();
        store
            .put_records(&input_location("test", &exec, Stage::Extraction), &items)
            .await
            .unwrap();

        let result = dispatcher(store.clone())
            .run_stage(
                Stage::Extraction,
                "test",
                &exec,
                DispatchOptions { max_items: Some(30) },
            )
            .await
            .unwrap();

        assert_eq!(result.status, StageStatus::Completed);
        assert_eq!(result.input_count, 30);
        assert_eq!(result.processed_count, 30);
        assert_eq!(result.batch_count, 2);
        assert_eq!(result.worker_count, 2);
    }
}

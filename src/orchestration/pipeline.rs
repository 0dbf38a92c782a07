//! # Pipeline Orchestrator
//!
//! Chains the stages in their fixed order, strictly sequentially:
//!
//! ```text
//! discovery -> extraction -> categorization -> classification -> vector_upload
//! ```
//!
//! Execution state is implicit: a stage is complete exactly when its consolidated
//! output exists in the durable store. That is what makes re-runs resumable (a
//! completed stage is skipped without invoking its dispatcher) and what
//! [`PipelineOrchestrator::get_status`] probes.
//!
//! The first stage that does not complete aborts the run with
//! [`BatchflowError::PipelineTerminal`], which carries the summaries gathered so
//! far. A summary artifact is written to `metadata/pipeline_summary.json` either
//! way; nothing reads it back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::config::BatchflowConfig;
use crate::constants::{files, PipelineStatus, ProbeStatus, Stage, StageStatus};
use crate::error::{BatchflowError, Result};
use crate::logging::log_error;
use crate::models::{
    ExecutionId, ExecutionStatusReport, PipelineResult, RecordSet, StageProbe, StageResult,
};
use crate::orchestration::dispatcher::{DispatchOptions, StageDispatcher};
use crate::storage::{DurableStore, RecordStoreExt, StoreKey};

/// Inputs of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    /// Resume or name a run; a fresh id is generated when absent.
    pub execution_id: Option<ExecutionId>,
    /// Storage scope; the configured default when absent.
    pub environment: Option<String>,
    /// Seed records for discovery (typically `{"url": ...}` base URLs).
    pub input: RecordSet,
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PipelineOrchestrator {
    dispatcher: Arc<StageDispatcher>,
    store: Arc<dyn DurableStore>,
    config: Arc<BatchflowConfig>,
}

impl PipelineOrchestrator {
    pub fn new(dispatcher: Arc<StageDispatcher>) -> Self {
        Self {
            store: Arc::clone(dispatcher.store()),
            config: Arc::clone(dispatcher.config()),
            dispatcher,
        }
    }

    #[instrument(skip(self, request), fields(execution_id, environment))]
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineResult> {
        let started = Instant::now();
        let execution_id = request.execution_id.clone().unwrap_or_else(ExecutionId::generate);
        let environment = request
            .environment
            .clone()
            .unwrap_or_else(|| self.config.pipeline.environment.clone());
        StoreKey::validate_environment(&environment)?;
        tracing::Span::current()
            .record("execution_id", execution_id.as_str())
            .record("environment", environment.as_str());

        let pipeline_timeout = self.config.pipeline.timeout();
        let deadline = started + pipeline_timeout;
        info!(
            seed_items = request.input.len(),
            max_items = request.max_items,
            "🚀 PIPELINE: starting run"
        );

        self.write_seed(&environment, &execution_id, &request.input)
            .await?;

        let options = DispatchOptions {
            max_items: request.max_items,
        };
        let mut summaries: Vec<StageResult> = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            if Instant::now() >= deadline {
                let source = BatchflowError::Timeout {
                    operation: format!("pipeline before stage {stage}"),
                    timeout: pipeline_timeout,
                };
                summaries.push(StageResult::failed(&execution_id, stage, source.to_string()));
                return Err(self
                    .abort(&environment, &execution_id, stage, source, summaries, started)
                    .await);
            }

            if self.config.pipeline.skip_completed {
                if let Some(skipped) = self.completed_stage(&environment, &execution_id, stage).await? {
                    info!(%stage, records = skipped.processed_count, "⏭️ PIPELINE: stage already complete, skipping");
                    summaries.push(skipped);
                    continue;
                }
            }

            info!(%stage, "▶️ PIPELINE: running stage");
            let result = match self
                .dispatcher
                .run_stage(stage, &environment, &execution_id, options)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    summaries.push(StageResult::failed(&execution_id, stage, e.to_string()));
                    return Err(self
                        .abort(&environment, &execution_id, stage, e, summaries, started)
                        .await);
                }
            };

            let status = result.status;
            let reason = result.error.clone();
            summaries.push(result);

            if status != StageStatus::Completed {
                let source = BatchflowError::stage_terminal(
                    stage,
                    execution_id.as_str(),
                    reason.unwrap_or_else(|| format!("stage finished with status {status}")),
                );
                return Err(self
                    .abort(&environment, &execution_id, stage, source, summaries, started)
                    .await);
            }
        }

        let last = summaries.last();
        let result = PipelineResult {
            execution_id: execution_id.clone(),
            environment: environment.clone(),
            status: PipelineStatus::Completed,
            final_output_location: last.and_then(|s| s.output_location.clone()),
            processed_count: last.map_or(0, |s| s.processed_count),
            error_count: PipelineResult::total_errors(&summaries),
            stage_summaries: summaries,
            duration_ms: elapsed_ms(started),
            error: None,
        };

        self.write_summary(&result).await;
        info!(
            processed_count = result.processed_count,
            error_count = result.error_count,
            duration_ms = result.duration_ms,
            "✅ PIPELINE: run completed"
        );
        Ok(result)
    }

    /// Probe every stage's consolidated output.
    pub async fn get_status(
        &self,
        execution_id: &ExecutionId,
        environment: &str,
    ) -> Result<ExecutionStatusReport> {
        StoreKey::validate_environment(environment)?;
        let mut stages = BTreeMap::new();
        for stage in Stage::ALL {
            let location = StoreKey::stage_output(environment, execution_id, stage);
            let probe = match self.store.get_records(&location).await {
                Ok(records) => StageProbe {
                    status: ProbeStatus::Completed,
                    record_count: Some(records.len()),
                    location,
                    error: None,
                },
                Err(e) if e.is_not_found() => StageProbe {
                    status: ProbeStatus::NotFound,
                    record_count: None,
                    location,
                    error: None,
                },
                Err(e) => {
                    warn!(%stage, error = %e, "⚠️ PIPELINE: stage output unreadable");
                    StageProbe {
                        status: ProbeStatus::NotFound,
                        record_count: None,
                        location,
                        error: Some(e.to_string()),
                    }
                }
            };
            stages.insert(stage, probe);
        }

        Ok(ExecutionStatusReport {
            execution_id: execution_id.clone(),
            environment: environment.to_string(),
            stages,
        })
    }

    /// Write discovery's seed unless discovery already completed. An empty request
    /// input reuses a seed left by an earlier attempt.
    async fn write_seed(
        &self,
        environment: &str,
        execution_id: &ExecutionId,
        input: &RecordSet,
    ) -> Result<()> {
        let discovery_output = StoreKey::stage_output(environment, execution_id, Stage::Discovery);
        if self.store.exists(&discovery_output).await? {
            return Ok(());
        }

        let seed = StoreKey::seed_input(environment, execution_id);
        if input.is_empty() && self.store.exists(&seed).await? {
            info!("🌱 PIPELINE: reusing existing seed");
            return Ok(());
        }

        self.store.put_records(&seed, input).await?;
        info!(seed_items = input.len(), location = %seed, "🌱 PIPELINE: seed written");
        Ok(())
    }

    async fn completed_stage(
        &self,
        environment: &str,
        execution_id: &ExecutionId,
        stage: Stage,
    ) -> Result<Option<StageResult>> {
        let location = StoreKey::stage_output(environment, execution_id, stage);
        match self.store.get_records(&location).await {
            Ok(records) => Ok(Some(StageResult::skipped(
                execution_id,
                stage,
                location,
                records.len(),
            ))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn abort(
        &self,
        environment: &str,
        execution_id: &ExecutionId,
        stage: Stage,
        source: BatchflowError,
        summaries: Vec<StageResult>,
        started: Instant,
    ) -> BatchflowError {
        error!(%stage, error = %source, "❌ PIPELINE: aborting run");
        log_error(
            "pipeline_orchestrator",
            "run",
            &source.to_string(),
            Some(&format!("execution_id={execution_id} stage={stage}")),
        );

        let failed = PipelineResult {
            execution_id: execution_id.clone(),
            environment: environment.to_string(),
            status: PipelineStatus::Failed,
            final_output_location: None,
            processed_count: 0,
            error_count: PipelineResult::total_errors(&summaries),
            stage_summaries: summaries,
            duration_ms: elapsed_ms(started),
            error: Some(source.to_string()),
        };
        self.write_summary(&failed).await;

        BatchflowError::PipelineTerminal {
            execution_id: execution_id.to_string(),
            stage,
            source: Box::new(source),
            stage_summaries: failed.stage_summaries,
        }
    }

    async fn write_summary(&self, result: &PipelineResult) {
        let key = StoreKey::metadata(
            &result.environment,
            &result.execution_id,
            files::PIPELINE_SUMMARY,
        );
        if let Err(e) = self.store.put_json(&key, result).await {
            warn!(location = %key, error = %e, "⚠️ PIPELINE: failed to write summary");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

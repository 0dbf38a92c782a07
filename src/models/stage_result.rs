//! Stage and pipeline results reported to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{PipelineStatus, Stage, StageStatus};
use crate::models::ExecutionId;
use crate::storage::StoreKey;

/// Aggregate outcome of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub execution_id: ExecutionId,
    pub stage: Stage,
    pub status: StageStatus,
    /// Items read from the previous stage (after any `max_items` truncation).
    pub input_count: usize,
    /// Rows in the consolidated output.
    pub processed_count: usize,
    /// Item errors, items of failed or lost batches, and materialization failures.
    pub error_count: usize,
    pub batch_count: usize,
    pub worker_count: usize,
    /// Batch numbers whose output was missing at consolidation time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_batches: Vec<u32>,
    /// Items that never reached a batch because their input write failed.
    pub materialization_failures: usize,
    pub output_location: Option<StoreKey>,
    /// Value counts for the stage's summary field, when one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<BTreeMap<String, usize>>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    /// Result for a stage that never got as far as dispatching batches.
    pub fn failed(execution_id: &ExecutionId, stage: Stage, error: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.clone(),
            stage,
            status: StageStatus::Failed,
            input_count: 0,
            processed_count: 0,
            error_count: 0,
            batch_count: 0,
            worker_count: 0,
            failed_batches: Vec::new(),
            materialization_failures: 0,
            output_location: None,
            distribution: None,
            duration_ms: 0,
            error: Some(error.into()),
        }
    }

    /// Result for a stage whose consolidated output already existed.
    pub fn skipped(
        execution_id: &ExecutionId,
        stage: Stage,
        output_location: StoreKey,
        record_count: usize,
    ) -> Self {
        Self {
            execution_id: execution_id.clone(),
            stage,
            status: StageStatus::Skipped,
            input_count: 0,
            processed_count: record_count,
            error_count: 0,
            batch_count: 0,
            worker_count: 0,
            failed_batches: Vec::new(),
            materialization_failures: 0,
            output_location: Some(output_location),
            distribution: None,
            duration_ms: 0,
            error: None,
        }
    }
}

/// Externally visible outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub execution_id: ExecutionId,
    pub environment: String,
    pub status: PipelineStatus,
    pub stage_summaries: Vec<StageResult>,
    pub final_output_location: Option<StoreKey>,
    pub processed_count: usize,
    pub error_count: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineResult {
    /// Sum of error counts across every stage summary.
    pub fn total_errors(summaries: &[StageResult]) -> usize {
        summaries.iter().map(|s| s.error_count).sum()
    }
}

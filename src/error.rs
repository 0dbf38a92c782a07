//! Error types for the batch dispatch engine.
//!
//! The taxonomy follows how far a failure is allowed to travel:
//!
//! - [`ItemError`] - one record failed its stage processor. Recorded inline as an
//!   error-tagged row, the batch continues.
//! - `BatchError` - a worker could not load, process or write a whole batch. Logged,
//!   the batch contributes zero rows, the stage continues.
//! - [`BatchflowError::StageTerminal`] - no input, or nothing consolidated. The stage is
//!   marked failed and the pipeline aborts.
//! - [`BatchflowError::PipelineTerminal`] - wraps the failing stage's error for the caller.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigurationError;
use crate::constants::Stage;
use crate::messaging::QueueError;
use crate::models::StageResult;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum BatchflowError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Batch error: batch {batch_number} of {stage}: {reason}")]
    Batch {
        stage: Stage,
        batch_number: u32,
        item_count: usize,
        reason: String,
    },

    #[error("Stage {stage} failed for execution {execution_id}: {reason}")]
    StageTerminal {
        stage: Stage,
        execution_id: String,
        reason: String,
    },

    #[error("Pipeline {execution_id} aborted at stage {stage}: {source}")]
    PipelineTerminal {
        execution_id: String,
        stage: Stage,
        #[source]
        source: Box<BatchflowError>,
        /// Summaries for every stage that ran (or was skipped) before the abort,
        /// including the failing one.
        stage_summaries: Vec<StageResult>,
    },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Timeout error: {operation} exceeded {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BatchflowError {
    pub fn stage_terminal(
        stage: Stage,
        execution_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StageTerminal {
            stage,
            execution_id: execution_id.into(),
            reason: reason.into(),
        }
    }

    pub fn batch(
        stage: Stage,
        batch_number: u32,
        item_count: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::Batch {
            stage,
            batch_number,
            item_count,
            reason: reason.into(),
        }
    }

    /// True for errors that end a stage (and therefore the pipeline).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StageTerminal { .. } | Self::PipelineTerminal { .. }
        )
    }

    /// The stage an error is attributed to, when it carries one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Batch { stage, .. }
            | Self::StageTerminal { stage, .. }
            | Self::PipelineTerminal { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchflowError>;

/// Failure of a single record inside a stage processor.
///
/// Processors return these instead of panicking so the worker can tag the row and
/// move on to the next item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ItemError {
    pub message: String,
    /// Whether the retry policy may re-invoke the processor for this record.
    pub retryable: bool,
}

impl ItemError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Failures surfaced by a [`crate::orchestration::TaskScheduler`] handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Task {task} panicked: {message}")]
    Panicked { task: String, message: String },
    #[error("Task {task} was cancelled")]
    Cancelled { task: String },
    #[error("Task {task} failed: {message}")]
    Failed { task: String, message: String },
}

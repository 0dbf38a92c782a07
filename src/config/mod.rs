//! # Configuration
//!
//! Typed configuration for the dispatch engine. Every section has defaults that
//! reproduce the production settings, so an empty configuration is valid.
//!
//! Sources are layered by [`ConfigManager`]:
//!
//! 1. built-in defaults ([`BatchflowConfig::default`])
//! 2. `config/batchflow.toml` (optional)
//! 3. `config/batchflow.{environment}.toml` (optional)
//! 4. `BATCHFLOW__*` environment variables, `__` separating nesting levels
//!    (e.g. `BATCHFLOW__STAGES__EXTRACTION__MAX_WORKERS=40`)

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::Stage;
use crate::resilience::RetryPolicy;
use crate::storage::StoreKey;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchflowConfig {
    pub planner: PlannerConfig,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub stages: StagesConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
}

impl BatchflowConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.planner.validate()?;

        if self.worker.dequeue_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.dequeue_timeout_ms",
                0,
                "dequeue timeout must be greater than 0",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                0,
                "at least one attempt is required",
            ));
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "multiplier must be at least 1.0",
            ));
        }

        for stage in Stage::ALL {
            self.stages.get(stage).validate(stage)?;
        }

        if self.pipeline.environment.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "pipeline.environment",
                "pipeline configuration",
            ));
        }
        if StoreKey::validate_environment(&self.pipeline.environment).is_err() {
            return Err(ConfigurationError::invalid_value(
                "pipeline.environment",
                &self.pipeline.environment,
                "environment must be a single path component",
            ));
        }
        if self.pipeline.timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "pipeline.timeout_seconds",
                0,
                "pipeline timeout must be greater than 0",
            ));
        }

        if self.queue.backend == QueueBackend::Pgmq && self.queue.database_url.is_none() {
            return Err(ConfigurationError::missing_required_field(
                "queue.database_url",
                "pgmq queue backend",
            ));
        }
        if self.queue.visibility_timeout_seconds <= 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.visibility_timeout_seconds",
                self.queue.visibility_timeout_seconds,
                "visibility timeout must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// How the planner sizes the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningPolicy {
    /// Batch size and worker cap from the tier table.
    #[default]
    Tiered,
    /// Batch size from the tier table, workers from the estimated stage runtime
    /// divided by `target_stage_duration_seconds`.
    TargetDuration,
}

/// One row of the tier table: inputs of at most `up_to` items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerTier {
    pub up_to: usize,
    pub batch_size: usize,
    pub max_workers: usize,
}

/// Limits applied above the largest tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub batch_size: usize,
    pub max_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub policy: PlanningPolicy,
    /// Ascending by `up_to`.
    pub tiers: Vec<PlannerTier>,
    pub overflow: TierLimits,
    pub target_stage_duration_seconds: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            policy: PlanningPolicy::Tiered,
            tiers: vec![
                PlannerTier {
                    up_to: 1_000,
                    batch_size: 25,
                    max_workers: 10,
                },
                PlannerTier {
                    up_to: 10_000,
                    batch_size: 25,
                    max_workers: 30,
                },
                PlannerTier {
                    up_to: 50_000,
                    batch_size: 50,
                    max_workers: 50,
                },
            ],
            overflow: TierLimits {
                batch_size: 100,
                max_workers: 100,
            },
            target_stage_duration_seconds: 1_800,
        }
    }
}

impl PlannerConfig {
    /// Tier limits for an input of `total` items.
    pub fn limits_for(&self, total: usize) -> TierLimits {
        self.tiers
            .iter()
            .find(|tier| total <= tier.up_to)
            .map(|tier| TierLimits {
                batch_size: tier.batch_size,
                max_workers: tier.max_workers,
            })
            .unwrap_or(self.overflow)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut previous: Option<usize> = None;
        for (index, tier) in self.tiers.iter().enumerate() {
            if previous.is_some_and(|p| tier.up_to <= p) {
                return Err(ConfigurationError::invalid_value(
                    format!("planner.tiers[{index}].up_to"),
                    tier.up_to,
                    "tier boundaries must be strictly ascending",
                ));
            }
            if tier.batch_size == 0 || tier.max_workers == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("planner.tiers[{index}]"),
                    format!("{}/{}", tier.batch_size, tier.max_workers),
                    "batch_size and max_workers must be greater than 0",
                ));
            }
            previous = Some(tier.up_to);
        }
        if self.overflow.batch_size == 0 || self.overflow.max_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "planner.overflow",
                format!("{}/{}", self.overflow.batch_size, self.overflow.max_workers),
                "batch_size and max_workers must be greater than 0",
            ));
        }
        if self.target_stage_duration_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "planner.target_stage_duration_seconds",
                0,
                "target duration must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long an idle worker waits on the queue before treating it as drained.
    pub dequeue_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

/// Processing profile for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Estimated processing cost per item, in minutes.
    pub estimated_item_cost_minutes: f64,
    /// Platform concurrency ceiling; the planned worker count never exceeds it.
    pub max_workers: usize,
    /// Upper bound on the whole dispatch of this stage.
    pub stage_timeout_seconds: u64,
    /// Upper bound on a single processor attempt.
    pub item_timeout_seconds: u64,
    /// Field whose value distribution is reported on the stage result.
    pub summary_field: Option<String>,
    /// External program that processes one record per invocation.
    pub command: Option<String>,
    pub command_args: Vec<String>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            estimated_item_cost_minutes: 1.0,
            max_workers: 10,
            stage_timeout_seconds: 3_600,
            item_timeout_seconds: 300,
            summary_field: None,
            command: None,
            command_args: Vec::new(),
        }
    }
}

impl StageSettings {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_seconds)
    }

    fn validate(&self, stage: Stage) -> ConfigResult<()> {
        if self.max_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("stages.{stage}.max_workers"),
                0,
                "stage concurrency ceiling must be greater than 0",
            ));
        }
        if self.stage_timeout_seconds == 0 || self.item_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("stages.{stage}"),
                format!(
                    "stage_timeout_seconds={} item_timeout_seconds={}",
                    self.stage_timeout_seconds, self.item_timeout_seconds
                ),
                "timeouts must be greater than 0",
            ));
        }
        if self.estimated_item_cost_minutes.is_nan() || self.estimated_item_cost_minutes < 0.0 {
            return Err(ConfigurationError::invalid_value(
                format!("stages.{stage}.estimated_item_cost_minutes"),
                self.estimated_item_cost_minutes,
                "cost must be a non-negative number",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub discovery: StageSettings,
    pub extraction: StageSettings,
    pub categorization: StageSettings,
    pub classification: StageSettings,
    pub vector_upload: StageSettings,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            discovery: StageSettings {
                estimated_item_cost_minutes: 0.5,
                max_workers: 10,
                item_timeout_seconds: 1_800,
                ..StageSettings::default()
            },
            extraction: StageSettings {
                estimated_item_cost_minutes: 1.0,
                max_workers: 100,
                item_timeout_seconds: 300,
                ..StageSettings::default()
            },
            categorization: StageSettings {
                estimated_item_cost_minutes: 0.17,
                max_workers: 50,
                item_timeout_seconds: 60,
                summary_field: Some("category".to_string()),
                ..StageSettings::default()
            },
            classification: StageSettings {
                estimated_item_cost_minutes: 0.25,
                max_workers: 15,
                item_timeout_seconds: 180,
                summary_field: Some("eligibility_status".to_string()),
                ..StageSettings::default()
            },
            vector_upload: StageSettings {
                estimated_item_cost_minutes: 0.3,
                max_workers: 10,
                item_timeout_seconds: 600,
                ..StageSettings::default()
            },
        }
    }
}

impl StagesConfig {
    pub fn get(&self, stage: Stage) -> &StageSettings {
        match stage {
            Stage::Discovery => &self.discovery,
            Stage::Extraction => &self.extraction,
            Stage::Categorization => &self.categorization,
            Stage::Classification => &self.classification,
            Stage::VectorUpload => &self.vector_upload,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageSettings {
        match stage {
            Stage::Discovery => &mut self.discovery,
            Stage::Extraction => &mut self.extraction,
            Stage::Categorization => &mut self.categorization,
            Stage::Classification => &mut self.classification,
            Stage::VectorUpload => &mut self.vector_upload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Environment used when a run does not name one.
    pub environment: String,
    /// Cooperative deadline for a whole run, checked before each stage.
    pub timeout_seconds: u64,
    /// Skip stages whose consolidated output already exists.
    pub skip_completed: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            timeout_seconds: 14_400,
            skip_completed: true,
        }
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    #[default]
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Filesystem,
            root: PathBuf::from("batchflow-data"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
    Pgmq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub database_url: Option<String>,
    /// Seconds a dequeued pgmq message stays invisible before redelivery.
    pub visibility_timeout_seconds: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            database_url: None,
            visibility_timeout_seconds: 1_800,
        }
    }
}

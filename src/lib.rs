#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Batchflow Core
//!
//! Dynamic batch dispatch and orchestration for multi-stage processing pipelines.
//!
//! ## Overview
//!
//! Work items flow through an ordered sequence of stages. Each stage partitions its
//! input into batches, fans them out to a pool of workers through a durable work
//! queue, and consolidates the per-batch outputs back into one ordered result set
//! that becomes the next stage's input. Intermediate results live in a durable
//! store, so a run that fails part-way resumes from the first incomplete stage.
//!
//! The per-record work (extraction, categorization, classification, upload) is not
//! part of this crate: it is injected as a [`StageProcessor`] per stage.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - planner, materializer, worker, scheduler, dispatcher,
//!   consolidator and pipeline orchestrator
//! - [`storage`] - durable store trait, typed keys, memory and filesystem stores
//! - [`messaging`] - work queue trait, in-memory queue, pgmq queue
//! - [`resilience`] - retry policy applied around processor calls
//! - [`models`] - execution ids, records, batch references, stage results
//! - [`config`] - layered configuration
//! - [`error`] - error taxonomy
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batchflow_core::{
//!     BatchflowConfig, InMemoryQueueProvider, MemoryStore, PipelineOrchestrator,
//!     PipelineRequest, ProcessorRegistry, StageDispatcher, TokioTaskScheduler,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> batchflow_core::Result<()> {
//! let dispatcher = StageDispatcher::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryQueueProvider::new()),
//!     Arc::new(TokioTaskScheduler::new(64)),
//!     Arc::new(ProcessorRegistry::new()),
//!     Arc::new(BatchflowConfig::default()),
//! );
//! let orchestrator = PipelineOrchestrator::new(Arc::new(dispatcher));
//!
//! let seed = serde_json::json!({ "url": "https://example.com" });
//! let result = orchestrator
//!     .run(PipelineRequest {
//!         input: vec![seed.as_object().cloned().unwrap_or_default()],
//!         ..PipelineRequest::default()
//!     })
//!     .await?;
//! println!("{} records, {} errors", result.processed_count, result.error_count);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod resilience;
pub mod storage;

pub use config::{BatchflowConfig, ConfigManager, ConfigurationError};
pub use constants::{PipelineStatus, ProbeStatus, Stage, StageStatus};
pub use error::{BatchflowError, ItemError, Result, SchedulerError};
pub use messaging::{
    Delivery, InMemoryQueueProvider, InMemoryWorkQueue, QueueError, QueueMessage, QueueProvider,
    WorkQueue,
};
#[cfg(feature = "postgres")]
pub use messaging::{PgmqQueueProvider, PgmqWorkQueue};
pub use models::{
    BatchReference, ExecutionId, ExecutionStatusReport, PipelineResult, Record, RecordSet,
    StageProbe, StageResult,
};
pub use orchestration::{
    BatchMaterializer, BatchPlan, BatchPlanner, Consolidator, DispatchOptions, ItemOutput,
    PipelineOrchestrator, PipelineRequest, ProcessorRegistry, StageDispatcher, StageProcessor,
    StageWorker, TaskScheduler, TokioTaskScheduler, WorkerReport,
};
pub use resilience::RetryPolicy;
pub use storage::{DurableStore, FileSystemStore, MemoryStore, RecordStoreExt, StoreError, StoreKey};

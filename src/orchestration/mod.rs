//! # Orchestration Engine
//!
//! Dynamic batch dispatch for multi-stage pipelines.
//!
//! ## Core Components
//!
//! - **BatchPlanner**: sizes batches and the worker pool for a stage input
//! - **BatchMaterializer**: slices the input and persists each batch's input
//! - **StageWorker**: drains a stage's work queue, one batch at a time
//! - **TaskScheduler**: spawns and joins workers (tokio tasks behind a semaphore)
//! - **StageDispatcher**: plan, materialize, enqueue, spawn, join, consolidate
//! - **Consolidator**: joins batch outputs in batch-number order
//! - **PipelineOrchestrator**: runs the stages in order, skips completed ones and
//!   probes execution status
//!
//! ## Data Flow
//!
//! ```text
//! seed_input.json
//!   -> [discovery]      -> discovered_items.json
//!   -> [extraction]     -> extracted_records.json
//!   -> [categorization] -> categorized_records.json
//!   -> [classification] -> classified_records.json
//!   -> [vector_upload]  -> uploaded_records.json
//! ```
//!
//! Each bracketed step is one [`StageDispatcher::run_stage`] call fanning out to
//! `batch_{n}_input.json` / `batch_{n}_output.json` pairs under the stage's path.

pub mod batch_materializer;
pub mod batch_planner;
pub mod consolidator;
pub mod dispatcher;
pub mod pipeline;
pub mod processor;
pub mod scheduler;
pub mod worker;

pub use batch_materializer::{partition, BatchMaterializer, MaterializationReport};
pub use batch_planner::{BatchPlan, BatchPlanner};
pub use consolidator::{ConsolidationReport, Consolidator};
pub use dispatcher::{input_location, DispatchOptions, StageDispatcher};
pub use pipeline::{PipelineOrchestrator, PipelineRequest};
pub use processor::{
    CommandProcessor, ItemOutput, PassthroughProcessor, ProcessorRegistry, StageProcessor,
    RETRYABLE_EXIT_CODE,
};
pub use scheduler::{TaskHandle, TaskScheduler, TokioTaskHandle, TokioTaskScheduler, WorkerTask};
pub use worker::{StageWorker, WorkerReport, WorkerSettings, WorkerState};

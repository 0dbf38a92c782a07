//! # Data Model
//!
//! Plain data types shared by the planner, workers, dispatcher and orchestrator.
//! Records are opaque associative maps; the core never interprets their fields
//! beyond the optional summary field of a stage.

pub mod batch_reference;
pub mod execution_id;
pub mod record;
pub mod stage_result;
pub mod status;

pub use batch_reference::BatchReference;
pub use execution_id::ExecutionId;
pub use record::{field_distribution, Record, RecordSet};
pub use stage_result::{PipelineResult, StageResult};
pub use status::{ExecutionStatusReport, StageProbe};

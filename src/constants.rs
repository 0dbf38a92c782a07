//! # Pipeline Constants
//!
//! The fixed stage enumeration, stage statuses and the canonical file names that
//! make up the durable layout of a pipeline execution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered pipeline stages.
///
/// Each stage consumes the consolidated output of the one before it; discovery
/// consumes the seed written at pipeline start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Extraction,
    Categorization,
    Classification,
    VectorUpload,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Discovery,
        Stage::Extraction,
        Stage::Categorization,
        Stage::Classification,
        Stage::VectorUpload,
    ];

    /// Storage path segment and queue-name component.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Extraction => "extraction",
            Stage::Categorization => "categorization",
            Stage::Classification => "classification",
            Stage::VectorUpload => "vector_upload",
        }
    }

    /// Canonical consolidated output file for the stage.
    pub fn output_filename(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovered_items.json",
            Stage::Extraction => "extracted_records.json",
            Stage::Categorization => "categorized_records.json",
            Stage::Classification => "classified_records.json",
            Stage::VectorUpload => "uploaded_records.json",
        }
    }

    pub fn previous(&self) -> Option<Stage> {
        let index = self.index();
        index.checked_sub(1).map(|i| Stage::ALL[i])
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn index(&self) -> usize {
        match self {
            Stage::Discovery => 0,
            Stage::Extraction => 1,
            Stage::Categorization => 2,
            Stage::Classification => 3,
            Stage::VectorUpload => 4,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(Stage::Discovery),
            "extraction" => Ok(Stage::Extraction),
            "categorization" => Ok(Stage::Categorization),
            "classification" => Ok(Stage::Classification),
            "vector_upload" | "vector-upload" => Ok(Stage::VectorUpload),
            other => Err(format!("Unknown stage: {other}")),
        }
    }
}

/// Outcome of a single stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    /// Consolidated output already existed; the dispatcher was not invoked.
    Skipped,
}

impl StageStatus {
    /// Whether the pipeline may proceed past a stage with this status.
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Completed => f.write_str("completed"),
            StageStatus::Failed => f.write_str("failed"),
            StageStatus::Skipped => f.write_str("skipped"),
        }
    }
}

/// Overall pipeline outcome reported at the CLI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Failed,
}

/// Per-stage probe result for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Completed,
    NotFound,
}

/// Durable file naming.
pub mod files {
    /// Seed written by the orchestrator as discovery's input.
    pub const SEED_INPUT: &str = "seed_input.json";
    /// Informational summary written at the end of a run.
    pub const PIPELINE_SUMMARY: &str = "pipeline_summary.json";
    /// Path segment for run-level metadata.
    pub const METADATA_SEGMENT: &str = "metadata";

    pub fn batch_input(batch_number: u32) -> String {
        format!("batch_{batch_number}_input.json")
    }

    pub fn batch_output(batch_number: u32) -> String {
        format!("batch_{batch_number}_output.json")
    }

    pub fn batch_errors(batch_number: u32) -> String {
        format!("batch_{batch_number}_errors.json")
    }
}

/// Field names used on error-tagged rows.
pub mod error_fields {
    pub const BATCH_NUMBER: &str = "_batch_number";
    pub const ITEM_INDEX: &str = "_item_index";
    pub const ERROR: &str = "_error";
    pub const ATTEMPTS: &str = "_attempts";
    pub const RECORD: &str = "_record";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering() {
        assert_eq!(Stage::Discovery.previous(), None);
        assert_eq!(Stage::Extraction.previous(), Some(Stage::Discovery));
        assert_eq!(Stage::Classification.next(), Some(Stage::VectorUpload));
        assert_eq!(Stage::VectorUpload.next(), None);
        assert!(Stage::Discovery < Stage::VectorUpload);
    }

    #[test]
    fn test_stage_round_trips_through_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!("vector-upload".parse::<Stage>().unwrap(), Stage::VectorUpload);
        assert!("ingest".parse::<Stage>().is_err());
    }

    #[test]
    fn test_batch_file_names() {
        assert_eq!(files::batch_input(0), "batch_0_input.json");
        assert_eq!(files::batch_output(12), "batch_12_output.json");
        assert_eq!(files::batch_errors(3), "batch_3_errors.json");
    }

    #[test]
    fn test_stage_status_success() {
        assert!(StageStatus::Completed.is_success());
        assert!(StageStatus::Skipped.is_success());
        assert!(!StageStatus::Failed.is_success());
    }
}

//! Status probe results.
//!
//! Status is derived purely from which stage outputs exist in the durable store,
//! so a probe from a separate process sees exactly what a resumed run would see.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{ProbeStatus, Stage};
use crate::models::ExecutionId;
use crate::storage::StoreKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProbe {
    pub status: ProbeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<usize>,
    pub location: StoreKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatusReport {
    pub execution_id: ExecutionId,
    pub environment: String,
    pub stages: BTreeMap<Stage, StageProbe>,
}

impl ExecutionStatusReport {
    /// Stages whose consolidated output exists, in pipeline order.
    pub fn completed_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|(_, probe)| probe.status == ProbeStatus::Completed)
            .map(|(stage, _)| *stage)
            .collect()
    }

    /// First stage without output, i.e. where a resumed run would start.
    pub fn resume_point(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| {
            self.stages
                .get(stage)
                .map_or(true, |probe| probe.status == ProbeStatus::NotFound)
        })
    }
}

//! Batch references: lightweight locators for a batch's durable input and output.

use serde::{Deserialize, Serialize};

use crate::constants::{files, Stage};
use crate::models::ExecutionId;
use crate::storage::StoreKey;

/// Locator for one materialized batch.
///
/// Created by the materializer, handed to exactly one worker through the queue,
/// then read by the consolidator. Never mutated: size and locations are fixed at
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReference {
    pub execution_id: ExecutionId,
    pub stage: Stage,
    /// 0-based, dense, assigned in input order.
    pub batch_number: u32,
    pub item_count: usize,
    pub input_location: StoreKey,
    pub output_location: StoreKey,
    pub environment: String,
}

impl BatchReference {
    pub fn new(
        environment: &str,
        execution_id: &ExecutionId,
        stage: Stage,
        batch_number: u32,
        item_count: usize,
    ) -> Self {
        Self {
            execution_id: execution_id.clone(),
            stage,
            batch_number,
            item_count,
            input_location: StoreKey::for_stage(
                environment,
                execution_id,
                stage,
                files::batch_input(batch_number),
            ),
            output_location: StoreKey::for_stage(
                environment,
                execution_id,
                stage,
                files::batch_output(batch_number),
            ),
            environment: environment.to_string(),
        }
    }

    /// Where error-tagged rows for this batch are written.
    pub fn errors_location(&self) -> StoreKey {
        StoreKey::for_stage(
            &self.environment,
            &self.execution_id,
            self.stage,
            files::batch_errors(self.batch_number),
        )
    }
}

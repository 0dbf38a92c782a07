//! # Batch Materializer
//!
//! Slices a stage's input into contiguous batches, persists each batch's input
//! and returns the [`BatchReference`]s for dispatch. Output locations are
//! recorded on the reference but never written here.
//!
//! A batch whose input cannot be written is left out of the returned references
//! and its items are reported as materialization failures; the remaining batches
//! still go out.

use futures::stream::{self, StreamExt};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::constants::Stage;
use crate::error::{BatchflowError, Result};
use crate::logging::log_error;
use crate::models::{BatchReference, ExecutionId, Record};
use crate::storage::{DurableStore, RecordStoreExt};

/// Concurrent batch input writes.
const WRITE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializationReport {
    /// Successfully written batches, ascending by batch number.
    pub batches: Vec<BatchReference>,
    pub failed_batches: Vec<u32>,
    /// Items belonging to batches that could not be written.
    pub failed_items: usize,
}

impl MaterializationReport {
    pub fn total_items(&self) -> usize {
        self.batches.iter().map(|b| b.item_count).sum::<usize>() + self.failed_items
    }
}

/// Index ranges of consecutive batches covering `0..len`.
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    if batch_size == 0 {
        return Vec::new();
    }
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

#[derive(Debug, Clone)]
pub struct BatchMaterializer {
    store: Arc<dyn DurableStore>,
}

impl BatchMaterializer {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn materialize(
        &self,
        items: &[Record],
        batch_size: usize,
        execution_id: &ExecutionId,
        stage: Stage,
        environment: &str,
    ) -> Result<MaterializationReport> {
        if items.is_empty() {
            return Ok(MaterializationReport::default());
        }
        if batch_size == 0 {
            return Err(BatchflowError::InvalidInput(format!(
                "batch size must be positive to materialize {} items",
                items.len()
            )));
        }

        let ranges = partition(items.len(), batch_size);
        let batch_total = ranges.len();

        let outcomes: Vec<(BatchReference, Result<()>)> = stream::iter(ranges.into_iter().enumerate())
            .map(|(index, range)| {
                let store = Arc::clone(&self.store);
                let batch_number = u32::try_from(index).unwrap_or(u32::MAX);
                let reference =
                    BatchReference::new(environment, execution_id, stage, batch_number, range.len());
                let slice = &items[range];
                async move {
                    let written = store
                        .put_records(&reference.input_location, slice)
                        .await
                        .map_err(BatchflowError::from);
                    (reference, written)
                }
            })
            .buffered(WRITE_CONCURRENCY)
            .collect()
            .await;

        let mut report = MaterializationReport::default();
        for (reference, written) in outcomes {
            match written {
                Ok(()) => {
                    debug!(
                        execution_id = %execution_id,
                        stage = %stage,
                        batch_number = reference.batch_number,
                        item_count = reference.item_count,
                        "🧩 MATERIALIZER: batch input written"
                    );
                    report.batches.push(reference);
                }
                Err(e) => {
                    error!(
                        execution_id = %execution_id,
                        stage = %stage,
                        batch_number = reference.batch_number,
                        item_count = reference.item_count,
                        error = %e,
                        "❌ MATERIALIZER: failed to write batch input, excluding batch"
                    );
                    log_error(
                        "batch_materializer",
                        "write_batch_input",
                        &e.to_string(),
                        Some(&reference.input_location.to_string()),
                    );
                    report.failed_batches.push(reference.batch_number);
                    report.failed_items += reference.item_count;
                }
            }
        }

        info!(
            execution_id = %execution_id,
            stage = %stage,
            batch_total,
            written = report.batches.len(),
            failed = report.failed_batches.len(),
            "🧩 MATERIALIZER: batches materialized"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn items(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| json!({ "id": i }).as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_partition_is_contiguous() {
        assert_eq!(partition(137, 25).len(), 6);
        assert_eq!(partition(137, 25).last(), Some(&(125..137)));
        assert_eq!(partition(50, 25), vec![0..25, 25..50]);
        assert!(partition(0, 25).is_empty());
        assert!(partition(10, 0).is_empty());
    }

    #[tokio::test]
    async fn test_materialize_writes_inputs_only() {
        let store = Arc::new(MemoryStore::new());
        let materializer = BatchMaterializer::new(store.clone());
        let exec = ExecutionId::generate();

        let report = materializer
            .materialize(&items(60), 25, &exec, Stage::Extraction, "test")
            .await
            .unwrap();

        assert_eq!(report.batches.len(), 3);
        assert_eq!(report.failed_items, 0);
        assert_eq!(
            report.batches.iter().map(|b| b.item_count).collect::<Vec<_>>(),
            vec![25, 25, 10]
        );
        assert_eq!(store.len(), 3);

        let last = store
            .get_records(&report.batches[2].input_location)
            .await
            .unwrap();
        assert_eq!(last[0]["id"], 50);
        assert!(!store.exists(&report.batches[0].output_location).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let materializer = BatchMaterializer::new(Arc::new(MemoryStore::new()));
        let result = materializer
            .materialize(&items(3), 0, &ExecutionId::generate(), Stage::Extraction, "test")
            .await;
        assert!(matches!(result, Err(BatchflowError::InvalidInput(_))));
    }
}

//! # Consolidator
//!
//! Joins per-batch outputs into a stage's single consolidated output, ordered by
//! batch number no matter which worker finished first. Missing or unreadable
//! batch outputs are logged and skipped.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{BatchReference, RecordSet};
use crate::storage::{DurableStore, RecordStoreExt, StoreKey};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationReport {
    pub records: RecordSet,
    pub output_location: StoreKey,
    pub batches_read: usize,
    /// Batches with no readable output, ascending.
    pub missing_batches: Vec<u32>,
    /// False when there was nothing to write.
    pub written: bool,
}

impl ConsolidationReport {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone)]
pub struct Consolidator {
    store: Arc<dyn DurableStore>,
}

impl Consolidator {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Concatenate the outputs of `batches` in ascending batch number and write the
    /// result to `output_location`.
    ///
    /// An empty concatenation is not written, so a stage that produced nothing is
    /// never mistaken for a completed one.
    pub async fn consolidate(
        &self,
        batches: &[BatchReference],
        output_location: &StoreKey,
    ) -> Result<ConsolidationReport> {
        let mut ordered: Vec<&BatchReference> = batches.iter().collect();
        ordered.sort_by_key(|batch| batch.batch_number);

        let mut records = RecordSet::new();
        let mut missing_batches = Vec::new();
        let mut batches_read = 0;

        for batch in ordered {
            match self.store.get_records(&batch.output_location).await {
                Ok(rows) => {
                    if rows.is_empty() {
                        debug!(
                            batch_number = batch.batch_number,
                            "📭 CONSOLIDATOR: batch produced no rows"
                        );
                    }
                    batches_read += 1;
                    records.extend(rows);
                }
                Err(e) if e.is_not_found() => {
                    warn!(
                        batch_number = batch.batch_number,
                        location = %batch.output_location,
                        "⚠️ CONSOLIDATOR: batch output missing, skipping"
                    );
                    missing_batches.push(batch.batch_number);
                }
                Err(e) => {
                    warn!(
                        batch_number = batch.batch_number,
                        location = %batch.output_location,
                        error = %e,
                        "⚠️ CONSOLIDATOR: batch output unreadable, skipping"
                    );
                    missing_batches.push(batch.batch_number);
                }
            }
        }

        let written = !records.is_empty();
        if written {
            self.store.put_records(output_location, &records).await?;
        } else {
            warn!(location = %output_location, "⚠️ CONSOLIDATOR: nothing to consolidate");
        }

        info!(
            location = %output_location,
            batches_read,
            missing = missing_batches.len(),
            record_count = records.len(),
            "📚 CONSOLIDATOR: consolidation complete"
        );

        Ok(ConsolidationReport {
            records,
            output_location: output_location.clone(),
            batches_read,
            missing_batches,
            written,
        })
    }
}

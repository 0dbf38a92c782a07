//! Scripted stage processors.

use async_trait::async_trait;
use batchflow_core::{ItemError, ItemOutput, Record, StageProcessor};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Stamps `field = value` on every record.
#[derive(Debug)]
pub struct StampProcessor {
    pub field: &'static str,
    pub value: Value,
}

impl StampProcessor {
    pub fn new(field: &'static str, value: impl Into<Value>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

#[async_trait]
impl StageProcessor for StampProcessor {
    fn name(&self) -> &str {
        "stamp"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        let mut out = record.clone();
        out.insert(self.field.to_string(), self.value.clone());
        Ok(out.into())
    }
}

/// Sleeps longer for lower ids so early batches finish last.
#[derive(Debug)]
pub struct ReverseLatencyProcessor {
    pub total: u64,
}

#[async_trait]
impl StageProcessor for ReverseLatencyProcessor {
    fn name(&self) -> &str {
        "reverse-latency"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        let id = record.get("id").and_then(Value::as_u64).unwrap_or(0);
        let delay = self.total.saturating_sub(id) / 10;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(record.clone().into())
    }
}

/// Categorizes by `id % 3`.
#[derive(Debug, Default)]
pub struct CategoryProcessor;

#[async_trait]
impl StageProcessor for CategoryProcessor {
    fn name(&self) -> &str {
        "category"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        let id = record.get("id").and_then(Value::as_u64).unwrap_or(0);
        let category = ["vision", "dental", "first_aid"][(id % 3) as usize];
        let mut out = record.clone();
        out.insert("category".to_string(), json!(category));
        Ok(out.into())
    }
}

/// Turns each seed `{"url": ...}` into `per_seed` discovered items with fresh ids.
#[derive(Debug)]
pub struct DiscoveryProcessor {
    pub per_seed: usize,
    next_id: AtomicUsize,
}

impl DiscoveryProcessor {
    pub fn new(per_seed: usize) -> Self {
        Self {
            per_seed,
            next_id: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StageProcessor for DiscoveryProcessor {
    fn name(&self) -> &str {
        "discovery"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        let base = record
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ItemError::permanent("seed record has no url"))?;
        let items = (0..self.per_seed)
            .map(|n| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                json!({ "id": id, "url": format!("{base}/products/{n}") })
                    .as_object()
                    .cloned()
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>();
        Ok(ItemOutput::FanOut(items))
    }
}

/// Fails every record whose id is in `failing_ids`.
#[derive(Debug)]
pub struct FailingIdsProcessor {
    pub failing_ids: std::ops::Range<u64>,
}

#[async_trait]
impl StageProcessor for FailingIdsProcessor {
    fn name(&self) -> &str {
        "failing-ids"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        let id = record.get("id").and_then(Value::as_u64).unwrap_or(0);
        if self.failing_ids.contains(&id) {
            return Err(ItemError::permanent(format!("record {id} rejected")));
        }
        Ok(record.clone().into())
    }
}

/// Rejects everything.
#[derive(Debug, Default)]
pub struct RejectAllProcessor;

#[async_trait]
impl StageProcessor for RejectAllProcessor {
    fn name(&self) -> &str {
        "reject-all"
    }

    async fn process(&self, _record: &Record) -> Result<ItemOutput, ItemError> {
        Err(ItemError::permanent("model unavailable"))
    }
}

/// Passes records through and counts invocations.
#[derive(Debug, Default)]
pub struct CountingProcessor {
    calls: AtomicUsize,
}

impl CountingProcessor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProcessor for CountingProcessor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(record.clone().into())
    }
}

/// Sleeps far past any test timeout.
#[derive(Debug, Default)]
pub struct StuckProcessor;

#[async_trait]
impl StageProcessor for StuckProcessor {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(record.clone().into())
    }
}

/// Hangs on the first record it sees and passes everything after.
#[derive(Debug, Default)]
pub struct StallOnceProcessor {
    stalled: AtomicBool,
}

#[async_trait]
impl StageProcessor for StallOnceProcessor {
    fn name(&self) -> &str {
        "stall-once"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(record.clone().into())
    }
}

/// Rejects ids in `rejected` and hangs on any id at or above `stall_from`.
#[derive(Debug)]
pub struct RejectThenStallProcessor {
    pub rejected: std::ops::Range<u64>,
    pub stall_from: u64,
}

#[async_trait]
impl StageProcessor for RejectThenStallProcessor {
    fn name(&self) -> &str {
        "reject-then-stall"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        let id = record.get("id").and_then(Value::as_u64).unwrap_or(0);
        if id >= self.stall_from {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.rejected.contains(&id) {
            return Err(ItemError::permanent(format!("record {id} rejected")));
        }
        Ok(record.clone().into())
    }
}

//! Shared helpers for integration tests: a dispatcher/orchestrator harness, a store
//! that fails selected writes, a scheduler that crashes selected workers, and
//! scripted stage processors.

#![allow(dead_code)]

pub mod processors;
pub mod strategies;

use async_trait::async_trait;
use batchflow_core::error::SchedulerError;
use batchflow_core::orchestration::{TaskHandle, WorkerTask};
use batchflow_core::{
    BatchflowConfig, BatchflowError, DurableStore, InMemoryQueueProvider, MemoryStore,
    PipelineOrchestrator, ProcessorRegistry, Record, StageDispatcher, StoreError, StoreKey,
    TaskScheduler, TokioTaskScheduler,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// `count` records `{"id": i, "name": "item-i"}` in order.
pub fn records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            json!({ "id": i, "name": format!("item-{i}") })
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

pub fn ids(records: &[Record]) -> Vec<u64> {
    records.iter().map(|r| r["id"].as_u64().unwrap()).collect()
}

/// Configuration tuned for fast tests: short dequeue timeout, no retry backoff.
pub fn test_config() -> BatchflowConfig {
    let mut config = BatchflowConfig::default();
    config.worker.dequeue_timeout_ms = 100;
    config.retry.base_backoff_ms = 0;
    config.pipeline.environment = "test".to_string();
    config
}

pub fn dispatcher(
    store: Arc<dyn DurableStore>,
    processors: ProcessorRegistry,
    config: BatchflowConfig,
) -> StageDispatcher {
    dispatcher_with_scheduler(store, processors, config, Arc::new(TokioTaskScheduler::new(128)))
}

pub fn dispatcher_with_scheduler(
    store: Arc<dyn DurableStore>,
    processors: ProcessorRegistry,
    config: BatchflowConfig,
    scheduler: Arc<dyn TaskScheduler>,
) -> StageDispatcher {
    StageDispatcher::new(
        store,
        Arc::new(InMemoryQueueProvider::new()),
        scheduler,
        Arc::new(processors),
        Arc::new(config),
    )
}

pub fn orchestrator(store: Arc<dyn DurableStore>, processors: ProcessorRegistry) -> PipelineOrchestrator {
    PipelineOrchestrator::new(Arc::new(dispatcher(store, processors, test_config())))
}

/// Memory store whose `put` fails for keys ending in any registered filename.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing_files: Mutex<HashSet<String>>,
    failed_puts: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_to(&self, filename: impl Into<String>) {
        self.failing_files.lock().insert(filename.into());
    }

    pub fn failed_puts(&self) -> usize {
        self.failed_puts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    async fn put(&self, key: &StoreKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        if self.failing_files.lock().contains(key.filename()) {
            self.failed_puts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Backend(format!("injected write failure for {key}")));
        }
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &StoreKey) -> Result<Vec<u8>, StoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// Scheduler that replaces the first `crashes` spawned workers with tasks that
/// fail immediately, without touching the queue.
#[derive(Debug)]
pub struct CrashingScheduler {
    inner: TokioTaskScheduler,
    remaining_crashes: AtomicUsize,
}

impl CrashingScheduler {
    pub fn new(crashes: usize) -> Self {
        Self {
            inner: TokioTaskScheduler::new(128),
            remaining_crashes: AtomicUsize::new(crashes),
        }
    }
}

impl TaskScheduler for CrashingScheduler {
    fn spawn(&self, name: String, task: WorkerTask) -> Box<dyn TaskHandle> {
        let crash = self
            .remaining_crashes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if crash {
            drop(task);
            let message = format!("{name} crashed on start");
            return self.inner.spawn(
                name,
                async move {
                    Err(BatchflowError::Scheduler(SchedulerError::Failed {
                        task: "injected".to_string(),
                        message,
                    }))
                }
                .boxed(),
            );
        }
        self.inner.spawn(name, task)
    }
}

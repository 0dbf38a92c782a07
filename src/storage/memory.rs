//! In-process store backed by a concurrent map. Used by tests and by local runs
//! that do not need output to outlive the process.
//!
//! ```rust
//! use batchflow_core::{ExecutionId, MemoryStore, RecordStoreExt, Stage, StoreKey};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::new();
//! let exec = ExecutionId::generate();
//! let key = StoreKey::stage_output("dev", &exec, Stage::Extraction);
//!
//! let record = json!({ "id": 1 }).as_object().cloned().unwrap();
//! store.put_records(&key, &[record]).await.unwrap();
//!
//! assert_eq!(store.get_records(&key).await.unwrap().len(), 1);
//! assert_eq!(store.len(), 1);
//! # });
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::{DurableStore, StoreError, StoreKey};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<DashMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Rendered keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().to_string()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, key: &StoreKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.objects.insert(key.clone(), bytes);
        Ok(())
    }

    async fn get(&self, key: &StoreKey) -> Result<Vec<u8>, StoreError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &StoreKey) -> Result<bool, StoreError> {
        Ok(self.objects.contains_key(key))
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.objects.remove(key);
        Ok(())
    }
}

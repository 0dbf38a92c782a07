//! # Durable Store
//!
//! Key/value blob storage for batch inputs, batch outputs and consolidated stage
//! outputs. Keys are always built (and parsed) through [`StoreKey`]:
//!
//! ```text
//! {environment}/{execution_id}/{stage}/{filename}
//! ```
//!
//! Each key is owned by exactly one batch or stage, so last-writer-wins is all the
//! consistency the engine needs from a backend.

pub mod filesystem;
pub mod memory;

pub use filesystem::FileSystemStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::constants::{files, Stage};
use crate::models::{ExecutionId, Record};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Third path component of a key: a stage, or run-level metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySegment {
    Stage(Stage),
    Metadata,
}

impl KeySegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySegment::Stage(stage) => stage.as_str(),
            KeySegment::Metadata => files::METADATA_SEGMENT,
        }
    }
}

/// Typed storage key. The only place path structure is defined and parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreKey {
    environment: String,
    execution_id: ExecutionId,
    segment: KeySegment,
    filename: String,
}

impl StoreKey {
    /// Build a key. `environment` and `filename` must be single path components;
    /// callers inside the crate only pass constants and validated config values.
    pub fn new(
        environment: &str,
        execution_id: &ExecutionId,
        segment: KeySegment,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            execution_id: execution_id.clone(),
            segment,
            filename: filename.into(),
        }
    }

    pub fn for_stage(
        environment: &str,
        execution_id: &ExecutionId,
        stage: Stage,
        filename: impl Into<String>,
    ) -> Self {
        Self::new(environment, execution_id, KeySegment::Stage(stage), filename)
    }

    /// Canonical consolidated output location of a stage.
    pub fn stage_output(environment: &str, execution_id: &ExecutionId, stage: Stage) -> Self {
        Self::for_stage(environment, execution_id, stage, stage.output_filename())
    }

    /// Seed location consumed by the discovery stage.
    pub fn seed_input(environment: &str, execution_id: &ExecutionId) -> Self {
        Self::for_stage(environment, execution_id, Stage::Discovery, files::SEED_INPUT)
    }

    pub fn metadata(
        environment: &str,
        execution_id: &ExecutionId,
        filename: impl Into<String>,
    ) -> Self {
        Self::new(environment, execution_id, KeySegment::Metadata, filename)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn segment(&self) -> KeySegment {
        self.segment
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Path components in order, for backends that map keys onto directories.
    pub fn components(&self) -> [&str; 4] {
        [
            &self.environment,
            self.execution_id.as_str(),
            self.segment.as_str(),
            &self.filename,
        ]
    }

    /// Check that `environment` can be used as the first key component. Callers
    /// that accept an environment from outside validate it before building keys.
    pub fn validate_environment(environment: &str) -> Result<(), StoreError> {
        Self::validate_component(environment, "environment", environment)
    }

    /// Check that this key renders to a path that parses back to itself.
    pub fn validate(&self) -> Result<(), StoreError> {
        let rendered = self.to_string();
        Self::validate_component(&rendered, "environment", &self.environment)?;
        Self::validate_component(&rendered, "filename", &self.filename)
    }

    fn validate_component(key: &str, name: &str, value: &str) -> Result<(), StoreError> {
        if value.is_empty()
            || value == "."
            || value == ".."
            || value.contains('/')
            || value.contains('\\')
        {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: format!("{name} '{value}' is not a valid path component"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.environment,
            self.execution_id,
            self.segment.as_str(),
            self.filename
        )
    }
}

impl FromStr for StoreKey {
    type Err = StoreError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = key.split('/').collect();
        let [environment, execution_id, segment, filename] = parts.as_slice() else {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: format!("expected 4 path components, found {}", parts.len()),
            });
        };

        Self::validate_component(key, "environment", environment)?;
        Self::validate_component(key, "filename", filename)?;

        let execution_id =
            execution_id
                .parse::<ExecutionId>()
                .map_err(|e| StoreError::InvalidKey {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;

        let segment = if *segment == files::METADATA_SEGMENT {
            KeySegment::Metadata
        } else {
            KeySegment::Stage(segment.parse::<Stage>().map_err(|reason| {
                StoreError::InvalidKey {
                    key: key.to_string(),
                    reason,
                }
            })?)
        };

        Ok(Self {
            environment: environment.to_string(),
            execution_id,
            segment,
            filename: filename.to_string(),
        })
    }
}

impl TryFrom<String> for StoreKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StoreKey> for String {
    fn from(value: StoreKey) -> Self {
        value.to_string()
    }
}

/// Blob storage backend.
#[async_trait]
pub trait DurableStore: Send + Sync + fmt::Debug {
    /// Write `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &StoreKey, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Read the value under `key`, or [`StoreError::NotFound`].
    async fn get(&self, key: &StoreKey) -> Result<Vec<u8>, StoreError>;

    async fn exists(&self, key: &StoreKey) -> Result<bool, StoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;
}

/// Typed helpers on top of any [`DurableStore`]. Records are stored as a compact
/// JSON array, which keeps repeated writes of the same records byte-identical.
#[async_trait]
pub trait RecordStoreExt: DurableStore {
    async fn put_json<T: Serialize + Sync + ?Sized>(
        &self,
        key: &StoreKey,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })?;
        self.put(key, bytes).await
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, key: &StoreKey) -> Result<T, StoreError> {
        let bytes = self.get(key).await?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })
    }

    async fn put_records(&self, key: &StoreKey, records: &[Record]) -> Result<(), StoreError> {
        self.put_json(key, records).await
    }

    async fn get_records(&self, key: &StoreKey) -> Result<Vec<Record>, StoreError> {
        self.get_json(key).await
    }
}

impl<S: DurableStore + ?Sized> RecordStoreExt for S {}

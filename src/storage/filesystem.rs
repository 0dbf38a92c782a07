//! Filesystem-backed store. Keys map onto `root/{environment}/{execution_id}/{stage}/{filename}`.
//!
//! Writes go to a temporary sibling file and are renamed into place, so readers
//! never observe a partially written object.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DurableStore, StoreError, StoreKey};

#[derive(Debug, Clone)]
pub struct FileSystemStore {
    root: PathBuf,
}

impl FileSystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &StoreKey) -> PathBuf {
        key.components()
            .iter()
            .fold(self.root.clone(), |path, component| path.join(component))
    }

    /// [`Self::path_for`] for keys that stay inside the root.
    fn checked_path(&self, key: &StoreKey) -> Result<PathBuf, StoreError> {
        key.validate()?;
        Ok(self.path_for(key))
    }

    fn io_error(key: &StoreKey, source: std::io::Error) -> StoreError {
        if source.kind() == ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl DurableStore for FileSystemStore {
    async fn put(&self, key: &StoreKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.checked_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    key: key.to_string(),
                    source,
                })?;
        }

        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        let written = match tokio::fs::write(&tmp, &bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(source) = written {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %e, "STORE: failed to remove temporary file");
                }
            }
            return Err(StoreError::Io {
                key: key.to_string(),
                source,
            });
        }

        debug!(key = %key, bytes = bytes.len(), "STORE: wrote object");
        Ok(())
    }

    async fn get(&self, key: &StoreKey) -> Result<Vec<u8>, StoreError> {
        tokio::fs::read(self.checked_path(key)?)
            .await
            .map_err(|e| Self::io_error(key, e))
    }

    async fn exists(&self, key: &StoreKey) -> Result<bool, StoreError> {
        tokio::fs::try_exists(self.checked_path(key)?)
            .await
            .map_err(|e| Self::io_error(key, e))
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.checked_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }
}

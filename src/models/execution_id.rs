//! Execution identifiers scoping every storage key and queue name of a run.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BatchflowError;

/// Opaque identifier for one pipeline run.
///
/// Generated once at pipeline start as `exec_{unix_seconds}_{8 hex chars}`.
/// Externally supplied ids are accepted as long as they are safe to embed in a
/// storage key and a queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn generate() -> Self {
        let timestamp = Utc::now().timestamp();
        let simple = Uuid::new_v4().simple().to_string();
        Self(format!("exec_{timestamp}_{}", &simple[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(value: &str) -> Result<(), BatchflowError> {
        if value.is_empty() {
            return Err(BatchflowError::InvalidInput(
                "execution id must not be empty".to_string(),
            ));
        }
        if value.len() > 64 {
            return Err(BatchflowError::InvalidInput(format!(
                "execution id '{value}' is longer than 64 characters"
            )));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(BatchflowError::InvalidInput(format!(
                "execution id '{value}' may only contain ASCII letters, digits, '_' and '-'"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = BatchflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for ExecutionId {
    type Error = BatchflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self(value))
    }
}

impl From<ExecutionId> for String {
    fn from(value: ExecutionId) -> Self {
        value.0
    }
}

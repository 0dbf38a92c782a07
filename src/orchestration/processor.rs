//! # Stage Processors
//!
//! The per-record work of a stage lives behind [`StageProcessor`]. Processors
//! never touch the queue or the store; they receive one record and return either
//! its output or an [`ItemError`]. The worker owns retries, timeouts and
//! persistence.
//!
//! A processor may fan out: discovery turns one seed record into many discovered
//! items by returning [`ItemOutput::FanOut`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::StagesConfig;
use crate::constants::Stage;
use crate::error::ItemError;
use crate::models::Record;

/// Exit status an external command uses to ask for a retry (`EX_TEMPFAIL`).
pub const RETRYABLE_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutput {
    Record(Record),
    FanOut(Vec<Record>),
}

impl ItemOutput {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            ItemOutput::Record(record) => vec![record],
            ItemOutput::FanOut(records) => records,
        }
    }
}

impl From<Record> for ItemOutput {
    fn from(record: Record) -> Self {
        ItemOutput::Record(record)
    }
}

impl From<Vec<Record>> for ItemOutput {
    fn from(records: Vec<Record>) -> Self {
        ItemOutput::FanOut(records)
    }
}

#[async_trait]
pub trait StageProcessor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError>;
}

/// Returns every record unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProcessor;

#[async_trait]
impl StageProcessor for PassthroughProcessor {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        Ok(ItemOutput::Record(record.clone()))
    }
}

/// Runs an external program once per record.
///
/// The record is written to stdin as JSON. stdout must hold a JSON object (one
/// output record) or an array of objects (fan-out). Exit status
/// [`RETRYABLE_EXIT_CODE`] marks the failure retryable; any other non-zero status
/// is permanent.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: format!("command:{program}"),
            program,
            args,
        }
    }

    fn parse_output(&self, stdout: &[u8]) -> Result<ItemOutput, ItemError> {
        let value: serde_json::Value = serde_json::from_slice(stdout).map_err(|e| {
            ItemError::permanent(format!("{} produced invalid JSON: {e}", self.program))
        })?;

        match value {
            serde_json::Value::Object(record) => Ok(ItemOutput::Record(record)),
            serde_json::Value::Array(values) => values
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::Object(record) => Ok(record),
                    other => Err(ItemError::permanent(format!(
                        "{} produced a non-object array element: {other}",
                        self.program
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ItemOutput::FanOut),
            other => Err(ItemError::permanent(format!(
                "{} produced {other}, expected an object or array",
                self.program
            ))),
        }
    }
}

#[async_trait]
impl StageProcessor for CommandProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, record: &Record) -> Result<ItemOutput, ItemError> {
        let input = serde_json::to_vec(record)
            .map_err(|e| ItemError::permanent(format!("record is not serializable: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ItemError::permanent(format!("failed to start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program may exit without reading its input; its exit status decides.
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ItemError::retryable(format!(
                        "failed to write to {}: {e}",
                        self.program
                    )));
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ItemError::retryable(format!("failed waiting on {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
            return Err(match output.status.code() {
                Some(RETRYABLE_EXIT_CODE) => ItemError::retryable(message),
                _ => ItemError::permanent(message),
            });
        }

        self.parse_output(&output.stdout)
    }
}

/// Processor lookup by stage. Stages without a registered processor use the
/// fallback, a [`PassthroughProcessor`] unless replaced.
#[derive(Debug, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<Stage, Arc<dyn StageProcessor>>,
    fallback: Arc<dyn StageProcessor>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: HashMap::new(),
            fallback: Arc::new(PassthroughProcessor),
        }
    }

    /// Registry with a [`CommandProcessor`] for every stage that configures a command.
    pub fn from_config(stages: &StagesConfig) -> Self {
        let mut registry = Self::new();
        for stage in Stage::ALL {
            let settings = stages.get(stage);
            if let Some(program) = &settings.command {
                debug!(%stage, %program, "🔌 REGISTRY: external command processor");
                registry.register(
                    stage,
                    Arc::new(CommandProcessor::new(program.clone(), settings.command_args.clone())),
                );
            }
        }
        registry
    }

    pub fn register(&mut self, stage: Stage, processor: Arc<dyn StageProcessor>) {
        self.processors.insert(stage, processor);
    }

    pub fn with_processor(mut self, stage: Stage, processor: Arc<dyn StageProcessor>) -> Self {
        self.register(stage, processor);
        self
    }

    pub fn with_fallback(mut self, processor: Arc<dyn StageProcessor>) -> Self {
        self.fallback = processor;
        self
    }

    pub fn get(&self, stage: Stage) -> Arc<dyn StageProcessor> {
        self.processors
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn is_registered(&self, stage: Stage) -> bool {
        self.processors.contains_key(&stage)
    }
}

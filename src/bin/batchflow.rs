//! # Batchflow CLI
//!
//! Runs a pipeline execution or reports the status of one. Results are printed to
//! stdout as JSON; logs go to stderr.

use anyhow::{bail, Context};
use batchflow_core::config::{QueueBackend, StorageBackend};
use batchflow_core::logging::init_structured_logging;
use batchflow_core::{
    BatchflowConfig, BatchflowError, ConfigManager, DurableStore, ExecutionId, FileSystemStore,
    InMemoryQueueProvider, MemoryStore, PipelineOrchestrator, PipelineRequest, ProcessorRegistry,
    QueueProvider, Record, Stage, StageDispatcher, TokioTaskScheduler,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::error;

#[derive(Parser)]
#[command(name = "batchflow")]
#[command(about = "Dynamic batch dispatch for multi-stage pipelines")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration directory (default: ./config)
    #[arg(short, long, env = "BATCHFLOW_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run (or resume) a pipeline execution
    Run {
        /// Execution to resume; a new id is generated when omitted
        #[arg(long)]
        execution_id: Option<String>,

        /// Storage environment (defaults to pipeline.environment)
        #[arg(short, long)]
        environment: Option<String>,

        /// JSON file holding an array of seed records, or `-` for stdin
        #[arg(short, long, conflicts_with = "url")]
        input: Option<PathBuf>,

        /// Base URL to seed discovery with (repeatable)
        #[arg(long)]
        url: Vec<String>,

        /// Limit every stage's input to this many records
        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Report which stages of an execution have completed
    Status {
        #[arg(long)]
        execution_id: String,

        #[arg(short, long)]
        environment: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    init_structured_logging();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "❌ CLI: command failed");
            eprintln!("error: {e:#}");
            process::exit(2);
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let manager = ConfigManager::load_from_directory(cli.config_dir)
        .context("failed to load configuration")?;
    let config = Arc::new(manager.config().clone());
    let orchestrator = build_orchestrator(Arc::clone(&config)).await?;

    match cli.command {
        Commands::Run {
            execution_id,
            environment,
            input,
            url,
            max_items,
        } => {
            let execution_id = execution_id
                .map(|id| id.parse::<ExecutionId>())
                .transpose()?;
            let input = load_seed(input, url).await?;
            let request = PipelineRequest {
                execution_id,
                environment,
                input,
                max_items,
            };

            match orchestrator.run(request).await {
                Ok(result) => {
                    print_json(&json!({
                        "execution_id": result.execution_id,
                        "status": result.status,
                        "stage_summaries": result.stage_summaries,
                        "final_output_location": result.final_output_location,
                        "processed_count": result.processed_count,
                        "error_count": result.error_count,
                        "duration_ms": result.duration_ms,
                    }))?;
                    Ok(0)
                }
                Err(BatchflowError::PipelineTerminal {
                    execution_id,
                    stage,
                    source,
                    stage_summaries,
                }) => {
                    print_json(&json!({
                        "execution_id": execution_id,
                        "status": "failed",
                        "failed_stage": stage,
                        "error": source.to_string(),
                        "stage_summaries": stage_summaries,
                        "final_output_location": Value::Null,
                    }))?;
                    Ok(1)
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::Status {
            execution_id,
            environment,
        } => {
            let execution_id: ExecutionId = execution_id.parse()?;
            let environment = environment.unwrap_or_else(|| config.pipeline.environment.clone());
            let report = orchestrator.get_status(&execution_id, &environment).await?;
            print_json(&report)?;
            Ok(0)
        }
    }
}

async fn build_orchestrator(config: Arc<BatchflowConfig>) -> anyhow::Result<PipelineOrchestrator> {
    let store: Arc<dyn DurableStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Filesystem => Arc::new(FileSystemStore::new(config.storage.root.clone())),
    };

    let queues: Arc<dyn QueueProvider> = match config.queue.backend {
        QueueBackend::Memory => Arc::new(InMemoryQueueProvider::new()),
        QueueBackend::Pgmq => pgmq_provider(&config).await?,
    };

    let max_concurrent = Stage::ALL
        .iter()
        .map(|stage| config.stages.get(*stage).max_workers)
        .max()
        .unwrap_or(1);

    let dispatcher = StageDispatcher::new(
        store,
        queues,
        Arc::new(TokioTaskScheduler::new(max_concurrent)),
        Arc::new(ProcessorRegistry::from_config(&config.stages)),
        config,
    );
    Ok(PipelineOrchestrator::new(Arc::new(dispatcher)))
}

#[cfg(feature = "postgres")]
async fn pgmq_provider(config: &BatchflowConfig) -> anyhow::Result<Arc<dyn QueueProvider>> {
    let url = config
        .queue
        .database_url
        .as_deref()
        .context("queue.database_url is required for the pgmq backend")?;
    let provider =
        batchflow_core::PgmqQueueProvider::connect(url, config.queue.visibility_timeout_seconds)
            .await?;
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "postgres"))]
async fn pgmq_provider(_config: &BatchflowConfig) -> anyhow::Result<Arc<dyn QueueProvider>> {
    bail!("the pgmq queue backend requires the `postgres` feature")
}

/// Seed records from `--url` values or a JSON array file (`-` reads stdin).
async fn load_seed(input: Option<PathBuf>, urls: Vec<String>) -> anyhow::Result<Vec<Record>> {
    if !urls.is_empty() {
        return Ok(urls
            .into_iter()
            .map(|url| {
                let mut record = Record::new();
                record.insert("url".to_string(), Value::String(url));
                record
            })
            .collect());
    }

    let Some(path) = input else {
        return Ok(Vec::new());
    };

    let raw = if path.as_os_str() == "-" {
        let mut buffer = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut buffer).await?;
        buffer
    } else {
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?
    };

    match serde_json::from_str::<Value>(&raw)? {
        Value::Array(values) => values
            .into_iter()
            .map(|value| match value {
                Value::Object(record) => Ok(record),
                other => bail!("seed entries must be JSON objects, found {other}"),
            })
            .collect(),
        _ => bail!("seed input must be a JSON array of objects"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

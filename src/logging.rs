//! # Structured Logging Module
//!
//! Environment-aware structured logging for dispatch runs. Output goes to stderr
//! so the CLI can keep stdout for its JSON results.
//!
//! `RUST_LOG` wins when set; otherwise the level follows the deployment
//! environment. `BATCHFLOW_LOG_FORMAT=json` switches to one JSON object per event.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ConfigManager;
use crate::constants::Stage;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));

        let layer = if use_json_format() {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // An embedding application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn use_json_format() -> bool {
    std::env::var("BATCHFLOW_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log a stage-level event (dispatch start, consolidation, completion).
pub fn log_stage_operation(
    operation: &str,
    execution_id: &str,
    stage: Stage,
    status: &str,
    item_count: Option<usize>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_id = %execution_id,
        stage = %stage,
        status = %status,
        item_count = item_count,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 STAGE_OPERATION"
    );
}

/// Log a batch-level event (materialized, processed, written).
pub fn log_batch_operation(
    operation: &str,
    execution_id: &str,
    stage: Stage,
    batch_number: u32,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_id = %execution_id,
        stage = %stage,
        batch_number = batch_number,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🧩 BATCH_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

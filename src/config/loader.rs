//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Defaults are serialized
//! into the first layer so partial files and environment overrides only need to
//! name the values they change.

use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::BatchflowConfig;

/// Prefix for environment variable overrides (`BATCHFLOW__SECTION__KEY`).
pub const ENV_PREFIX: &str = "BATCHFLOW";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug)]
pub struct ConfigManager {
    config: BatchflowConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection from `./config`.
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load with an explicit environment; tests use this to avoid touching
    /// process-wide environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment,
            directory = %config_directory.display(),
            "⚙️ CONFIG: loading configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment,
            storage_backend = ?config.storage.backend,
            queue_backend = ?config.queue.backend,
            planner_policy = ?config.planner.policy,
            "✅ CONFIG: configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, validating it.
    pub fn from_config(config: BatchflowConfig, environment: &str) -> ConfigResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: PathBuf::from("config"),
        }))
    }

    pub fn config(&self) -> &BatchflowConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<BatchflowConfig> {
        let defaults = Config::try_from(&BatchflowConfig::default())
            .map_err(|e| ConfigurationError::load_error("defaults", e))?;

        let base = config_directory.join("batchflow.toml");
        let overlay = config_directory.join(format!("batchflow.{environment}.toml"));
        for path in [&base, &overlay] {
            if path.is_file() {
                debug!(path = %path.display(), "⚙️ CONFIG: merging configuration file");
            }
        }

        let settings = Config::builder()
            .add_source(defaults)
            .add_source(File::from(base.as_path()).format(FileFormat::Toml).required(false))
            .add_source(
                File::from(overlay.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(config_directory.display().to_string(), e))?;

        Ok(settings.try_deserialize::<BatchflowConfig>()?)
    }

    /// `BATCHFLOW_ENV`, then `APP_ENV`, defaulting to `development`.
    pub fn detect_environment() -> String {
        env::var("BATCHFLOW_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}

//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered with the
//! `config` crate, later sources overriding earlier ones:
//!
//! 1. `<dir>/docstore.yaml` (required)
//! 2. `<dir>/docstore.<environment>.yaml` (optional)
//! 3. `DOCSTORE__SECTION__FIELD` environment variables

use super::error::{ConfigResult, ConfigurationError};
use super::ClientConfig;
use config::{Config, Environment, File};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE: &str = "docstore.yaml";
const ENV_PREFIX: &str = "DOCSTORE";
const ENV_SEPARATOR: &str = "__";

pub struct ConfigManager {
    config: ClientConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment and directory auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(Self::default_config_directory(), &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_directory: impl Into<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_env_source(config_directory.into(), environment, None)
    }

    /// Same as [`load_from_directory_with_env`](Self::load_from_directory_with_env)
    /// but reads variable overrides from `variables` instead of the process environment.
    pub fn load_with_variables(
        config_directory: impl Into<PathBuf>,
        environment: &str,
        variables: HashMap<String, String>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_env_source(config_directory.into(), environment, Some(variables))
    }

    fn load_with_env_source(
        config_directory: PathBuf,
        environment: &str,
        variables: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let base_path = config_directory.join(BASE_FILE);
        if !base_path.exists() {
            return Err(ConfigurationError::ConfigFileNotFound { path: base_path });
        }
        let environment_path = config_directory.join(format!("docstore.{environment}.yaml"));

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading client configuration"
        );

        let settings = Config::builder()
            .add_source(File::from(base_path.as_path()).required(true))
            .add_source(File::from(environment_path.as_path()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .source(variables),
            )
            .build()
            .map_err(|e| ConfigurationError::LoadError {
                environment: environment.to_string(),
                error: e.to_string(),
            })?;

        let config: ClientConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::DeserializationError {
                error: e.to_string(),
            })?;

        config.validate()?;

        info!(
            environment = %environment,
            endpoints = config.endpoints.len(),
            max_connections = config.pool.max_connections,
            retry_max_attempts = config.retry.max_attempts,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect environment from `DOCSTORE_ENV`, then `APP_ENV`
    pub fn detect_environment() -> String {
        env::var("DOCSTORE_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("DOCSTORE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}

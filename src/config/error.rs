//! Configuration Error Types
//!
//! Errors raised while loading and validating client configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Base configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigFileNotFound { path: PathBuf },

    /// The layered sources could not be read or merged
    #[error("Failed to load configuration for environment '{environment}': {error}")]
    LoadError { environment: String, error: String },

    /// The merged configuration did not match the expected shape
    #[error("Invalid configuration structure: {error}")]
    DeserializationError { error: String },

    /// Invalid configuration value
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigurationError> for crate::error::ClientError {
    fn from(error: ConfigurationError) -> Self {
        crate::error::ClientError::Configuration(error.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;

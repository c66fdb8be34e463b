//! Connection pool configuration and deployment presets.

use crate::config::{ConfigResult, ConfigurationError};
use crate::utils::serde::{duration_ms, optional_duration_ms};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Upper bound on connections in existence, borrowed or idle
    pub max_connections: usize,

    /// Connections kept warm by `initialize` and the eviction sweep
    pub min_connections: usize,

    /// Idle connections above `min_connections` are evicted after this long
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,

    /// How long `borrow` waits for a returned connection at capacity.
    /// Zero fails immediately.
    #[serde(rename = "acquisition_timeout_ms", with = "duration_ms")]
    pub acquisition_timeout: Duration,

    pub validate_on_borrow: bool,

    pub validate_on_return: bool,

    pub validate_while_idle: bool,

    /// Minimum time between idle validations of one connection
    #[serde(rename = "validation_interval_ms", with = "duration_ms")]
    pub validation_interval: Duration,

    /// Run the background eviction sweep
    pub eviction_enabled: bool,

    #[serde(rename = "eviction_interval_ms", with = "duration_ms")]
    pub eviction_interval: Duration,

    /// Maximum lifetime of a connection regardless of use
    #[serde(rename = "connection_ttl_ms", with = "optional_duration_ms")]
    pub connection_ttl: Option<Duration>,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            idle_timeout: Duration::from_secs(300),
            acquisition_timeout: Duration::from_secs(5),
            validate_on_borrow: true,
            validate_on_return: false,
            validate_while_idle: false,
            validation_interval: Duration::from_secs(30),
            eviction_enabled: true,
            eviction_interval: Duration::from_secs(60),
            connection_ttl: None,
        }
    }
}

impl ConnectionPoolConfig {
    /// Many concurrent callers, fast failure when saturated
    ///
    /// - Large pool with a warm floor
    /// - Short acquisition wait to avoid queueing
    /// - Borrow validation skipped for throughput
    pub fn high_throughput() -> Self {
        Self {
            max_connections: 64,
            min_connections: 8,
            idle_timeout: Duration::from_secs(120),
            acquisition_timeout: Duration::from_millis(500),
            validate_on_borrow: false,
            validate_while_idle: true,
            connection_ttl: Some(Duration::from_secs(1800)),
            ..Self::default()
        }
    }

    /// Containers and short-lived processes
    pub fn resource_constrained() -> Self {
        Self {
            max_connections: 4,
            min_connections: 0,
            idle_timeout: Duration::from_secs(900),
            acquisition_timeout: Duration::from_secs(15),
            ..Self::default()
        }
    }

    /// Small pool, every check enabled, quick feedback
    pub fn development() -> Self {
        Self {
            max_connections: 4,
            min_connections: 1,
            acquisition_timeout: Duration::from_secs(1),
            validate_on_borrow: true,
            validate_on_return: true,
            eviction_interval: Duration::from_secs(10),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "pool.max_connections",
                "must be greater than 0",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigurationError::invalid_value(
                "pool.min_connections",
                format!(
                    "{} exceeds max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        if self.eviction_enabled && self.eviction_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "pool.eviction_interval_ms",
                "must be greater than 0 when eviction is enabled",
            ));
        }
        if self.connection_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConfigurationError::invalid_value(
                "pool.connection_ttl_ms",
                "must be greater than 0 or null",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            ConnectionPoolConfig::default(),
            ConnectionPoolConfig::high_throughput(),
            ConnectionPoolConfig::resource_constrained(),
            ConnectionPoolConfig::development(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let config = ConnectionPoolConfig {
            max_connections: 2,
            min_connections: 3,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { field, .. }) if field == "pool.min_connections"
        ));
    }
}

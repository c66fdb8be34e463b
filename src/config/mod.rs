//! # Client Configuration
//!
//! One root structure, [`ClientConfig`], gathers the policy sections the client
//! is built from. Each section lives next to the component it configures and is
//! re-exported here.
//!
//! Files express durations in milliseconds (`initial_delay_ms: 100`). Sections
//! and fields may be omitted; defaults fill the gaps.
//!
//! ```yaml
//! endpoints:
//!   - address: "node-a:11210"
//!   - address: "node-b:11210"
//!     weight: 2
//! pool:
//!   max_connections: 16
//! retry:
//!   max_attempts: 4
//!   backoff: exponential
//!   retry_on_errors: [temporary_failure, timeout]
//! failover:
//!   load_balancing_strategy: least_connections
//! transaction:
//!   auto_rollback: true
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

pub use crate::client::QueryCacheConfig;
pub use crate::pool::ConnectionPoolConfig;
pub use crate::resilience::{FailoverConfig, RetryPolicy};
pub use crate::transaction::TransactionConfig;

use crate::resilience::Endpoint;
use serde::{Deserialize, Serialize};

/// Root configuration structure mirroring `docstore.yaml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Candidate cluster endpoints, in preference order
    pub endpoints: Vec<Endpoint>,

    pub pool: ConnectionPoolConfig,

    pub retry: RetryPolicy,

    pub failover: FailoverConfig,

    pub transaction: TransactionConfig,

    pub query_cache: QueryCacheConfig,
}

impl ClientConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.endpoints.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "endpoints",
                "at least one endpoint is required",
            ));
        }
        for endpoint in &self.endpoints {
            if endpoint.address.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    "endpoints.address",
                    "must not be empty",
                ));
            }
            if endpoint.weight == 0 {
                return Err(ConfigurationError::invalid_value(
                    "endpoints.weight",
                    format!("weight of {} must be greater than 0", endpoint.address),
                ));
            }
        }
        self.pool.validate()?;
        self.retry.validate()?;
        self.failover.validate()?;
        self.query_cache.validate()?;
        Ok(())
    }
}

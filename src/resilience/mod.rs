//! # Resilience Module
//!
//! Fault tolerance for calls against the document store cluster.
//!
//! ## Architecture
//!
//! - **Retry**: bounded retries with exponential or linear backoff and jitter
//! - **Circuit Breakers**: fail fast while a cluster is unhealthy
//! - **Failover**: endpoint rotation driven by a circuit breaker and a load balancing strategy
//! - **Metrics Collection**: failure rates and state transitions
//!
//! ## Usage
//!
//! ```rust,no_run
//! use docstore_client::resilience::{RetryManager, RetryPolicy};
//! use docstore_client::ClientError;
//!
//! let retry = RetryManager::new(RetryPolicy::default());
//! let value = retry.execute_with_retry(|| Ok::<_, ClientError>(42))?;
//! # Ok::<(), ClientError>(())
//! ```

pub mod circuit_breaker;
pub mod failover;
pub mod metrics;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use failover::{
    ActiveOperation, Endpoint, FailoverConfig, FailoverManager, FailoverStats, HealthProbe,
    LoadBalancingStrategy,
};
pub use metrics::CircuitBreakerMetrics;
pub use retry::{BackoffStrategy, RetryManager, RetryPolicy, RetryPredicate, RetryStats};

//! # Circuit Breaker Metrics
//!
//! Counters kept by a [`CircuitBreaker`](super::CircuitBreaker) and the derived
//! rates exposed through snapshots.

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Total number of outcomes recorded
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Failures counted toward the threshold (within the failure window)
    pub consecutive_failures: u64,

    /// Successful probes recorded since entering half-open
    pub half_open_calls: u64,

    /// Calls refused while open
    pub rejected_calls: u64,

    /// Number of state changes since creation
    pub state_transitions: u64,

    /// Total duration of operations run through `call`
    pub total_duration: Duration,

    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    /// Calculated success rate (0.0 to 1.0)
    pub success_rate: f64,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            half_open_calls: 0,
            rejected_calls: 0,
            state_transitions: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
        }
    }

    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing endpoint health",
        }
    }

    pub(crate) fn with_rates(mut self) -> Self {
        if self.total_calls > 0 {
            self.failure_rate = self.failure_count as f64 / self.total_calls as f64;
            self.success_rate = self.success_count as f64 / self.total_calls as f64;
        }
        self
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_metrics_creation() {
        let metrics = CircuitBreakerMetrics::new();

        assert_eq!(metrics.total_calls, 0);
        assert_eq!(metrics.success_count, 0);
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.current_state, CircuitState::Closed);
        assert!(metrics.is_healthy());
    }

    #[test]
    fn test_metrics_health_calculation() {
        let mut metrics = CircuitBreakerMetrics::new();
        metrics.total_calls = 20;
        metrics.failure_count = 1;
        metrics.success_count = 19;
        let metrics = metrics.with_rates();
        assert!((metrics.failure_rate - 0.05).abs() < f64::EPSILON);
        assert!(metrics.is_healthy());

        let mut open = metrics.clone();
        open.current_state = CircuitState::Open;
        assert!(!open.is_healthy());
        assert_eq!(open.state_description(), "Failing - Rejecting all calls");
    }
}

//! # Circuit Breaker Implementation
//!
//! Stops issuing operations to a failing endpoint until it is likely healthy again.
//! Three states: Closed (normal operation), Open (failing fast), and Half-Open
//! (probing recovery). Transitions are decided under a single lock; the state is
//! mirrored in an atomic so readers never block.

use crate::error::{ClientError, ClientResult};
use crate::resilience::CircuitBreakerMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - limited calls allowed to probe endpoint health
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures (within `failure_window`, if set) before opening the circuit
    pub failure_threshold: u32,

    /// Time to stay open before letting a probe through
    pub recovery_timeout: Duration,

    /// Successful probes in half-open state needed to close the circuit
    pub success_threshold: u32,

    /// Only failures this recent count toward the threshold. `None` counts
    /// every failure since the last success.
    pub failure_window: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
            failure_window: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }
        if self.recovery_timeout.is_zero() {
            return Err("recovery_timeout must be greater than 0".to_string());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerState {
    metrics: CircuitBreakerMetrics,
    opened_at: Option<Instant>,
    recent_failures: VecDeque<Instant>,
    /// Half-open probes admitted but not yet reported
    probes_in_flight: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Mirror of the current state for lock-free reads
    state: AtomicU8,

    config: CircuitBreakerConfig,

    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            inner: Mutex::new(BreakerState {
                metrics: CircuitBreakerMetrics::new(),
                opened_at: None,
                recent_failures: VecDeque::new(),
                probes_in_flight: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call may proceed. An open circuit whose recovery timeout
    /// has elapsed moves to half-open and lets the probe through. Half-open
    /// admits at most `success_threshold` probes at once; each admitted call
    /// must be reported through `record_success`, `record_failure` or
    /// `release_probe`.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probes_in_flight = 1;
                    true
                } else {
                    inner.metrics.rejected_calls += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                let admitted = inner.metrics.half_open_calls + inner.probes_in_flight;
                if admitted < u64::from(self.config.success_threshold) {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    inner.metrics.rejected_calls += 1;
                    false
                }
            }
        }
    }

    /// Give back a half-open probe slot for a call that never reached the
    /// endpoint, without counting it as a success or failure
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if self.state() == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Execute an operation with circuit breaker protection
    pub fn call<T, F>(&self, operation: F) -> ClientResult<T>
    where
        F: FnOnce() -> ClientResult<T>,
    {
        if !self.allow_request() {
            return Err(ClientError::CircuitBreakerOpen {
                component: self.name.clone(),
            });
        }

        let start = Instant::now();
        let result = operation();
        let duration = start.elapsed();
        self.inner.lock().metrics.total_duration += duration;

        match &result {
            Ok(_) => {
                self.record_success();
            }
            Err(_) => {
                self.record_failure();
            }
        }
        result
    }

    /// Record a successful operation and return the resulting state
    pub fn record_success(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;

        debug!(component = %self.name, "🟢 Operation succeeded");

        match self.state() {
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.metrics.half_open_calls += 1;
                if inner.metrics.half_open_calls >= u64::from(self.config.success_threshold) {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                inner.recent_failures.clear();
                inner.metrics.consecutive_failures = 0;
            }
            CircuitState::Open => {
                warn!(component = %self.name, "Success recorded while circuit is open");
            }
        }
        self.state()
    }

    /// Record a failed operation and return the resulting state
    pub fn record_failure(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;

        match self.state() {
            CircuitState::Closed => {
                inner.recent_failures.push_back(now);
                if let Some(window) = self.config.failure_window {
                    while inner
                        .recent_failures
                        .front()
                        .is_some_and(|at| now.duration_since(*at) > window)
                    {
                        inner.recent_failures.pop_front();
                    }
                }
                inner.metrics.consecutive_failures = inner.recent_failures.len() as u64;

                debug!(
                    component = %self.name,
                    failures = inner.metrics.consecutive_failures,
                    failure_threshold = self.config.failure_threshold,
                    "🔴 Operation failed"
                );

                if inner.metrics.consecutive_failures >= u64::from(self.config.failure_threshold) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // A failed probe reopens and restarts the recovery timer
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
        self.state()
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Time left before an open circuit admits a probe
    pub fn remaining_open_time(&self) -> Option<Duration> {
        if self.state() != CircuitState::Open {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .opened_at
            .map(|opened| self.config.recovery_timeout.saturating_sub(opened.elapsed()))
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let mut snapshot = inner.metrics.clone();
        snapshot.current_state = self.state();
        snapshot.with_rates()
    }

    /// Closed with a low failure rate
    pub fn is_healthy(&self) -> bool {
        if self.state() != CircuitState::Closed {
            return false;
        }
        let inner = self.inner.lock();
        if inner.metrics.total_calls < 10 {
            return true;
        }
        let failure_rate = inner.metrics.failure_count as f64 / inner.metrics.total_calls as f64;
        failure_rate < 0.1
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = self.state();
        self.state.store(to as u8, Ordering::Release);
        if from != to {
            inner.metrics.state_transitions += 1;
        }
        inner.metrics.half_open_calls = 0;
        inner.probes_in_flight = 0;

        match to {
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.recent_failures.clear();
                inner.metrics.consecutive_failures = 0;
                info!(
                    component = %self.name,
                    from = %from,
                    total_calls = inner.metrics.total_calls,
                    "🟢 Circuit breaker closed (recovered)"
                );
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                error!(
                    component = %self.name,
                    from = %from,
                    consecutive_failures = inner.metrics.consecutive_failures,
                    failure_threshold = self.config.failure_threshold,
                    recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                    "🔴 Circuit breaker opened (failing fast)"
                );
            }
            CircuitState::HalfOpen => {
                info!(
                    component = %self.name,
                    success_threshold = self.config.success_threshold,
                    "🟡 Circuit breaker half-open (testing recovery)"
                );
            }
        }
    }
}

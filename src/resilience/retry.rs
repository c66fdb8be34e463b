//! # Retry Policy
//!
//! Bounded retries with exponential or linear backoff and jitter. The backoff
//! sleep blocks the calling thread; there is no cancellation. Callers that need
//! an early abort should set `retry_timeout`, which bounds the cumulative wall
//! clock time spent retrying.

use crate::config::{ConfigResult, ConfigurationError};
use crate::error::{ClientError, ClientResult, ErrorKind};
use crate::logging::log_retry_attempt;
use crate::utils::serde::{duration_ms, optional_duration_ms};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `delay * backoff_multiplier`, capped at `max_delay`
    #[default]
    Exponential,
    /// `delay + initial_delay`, capped at `max_delay`
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `0` and `1` both mean "no retry".
    pub max_attempts: u32,

    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,

    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,

    pub backoff_multiplier: f64,

    /// Upper bound of the random fraction added to each delay (0.0 - 1.0)
    pub jitter_factor: f64,

    pub backoff: BackoffStrategy,

    /// Error kinds that are retried
    pub retry_on_errors: Vec<ErrorKind>,

    /// Error kinds that are never retried
    pub no_retry_errors: Vec<ErrorKind>,

    /// Cumulative wall-clock budget for the whole retry loop
    #[serde(rename = "retry_timeout_ms", with = "optional_duration_ms")]
    pub retry_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            backoff: BackoffStrategy::Exponential,
            retry_on_errors: vec![
                ErrorKind::TemporaryFailure,
                ErrorKind::Timeout,
                ErrorKind::NetworkError,
                ErrorKind::ConnectionFailed,
                ErrorKind::ConnectionPoolExhausted,
                ErrorKind::DocumentLocked,
            ],
            no_retry_errors: vec![
                ErrorKind::DocumentNotFound,
                ErrorKind::DocumentExists,
                ErrorKind::CasMismatch,
                ErrorKind::InvalidArgument,
                ErrorKind::CircuitBreakerOpen,
            ],
            retry_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(ConfigurationError::invalid_value(
                "retry.backoff_multiplier",
                "must be a finite value >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigurationError::invalid_value(
                "retry.jitter_factor",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigurationError::invalid_value(
                "retry.initial_delay_ms",
                "must not exceed max_delay_ms",
            ));
        }
        if let Some(kind) = self
            .retry_on_errors
            .iter()
            .find(|kind| self.no_retry_errors.contains(kind))
        {
            return Err(ConfigurationError::invalid_value(
                "retry.retry_on_errors",
                format!("{kind} is listed in both retry_on_errors and no_retry_errors"),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt + 1`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 0..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = self.next_delay(delay);
        }
        delay
    }

    /// Grow `delay` by one step of the configured strategy
    pub fn next_delay(&self, delay: Duration) -> Duration {
        match self.backoff {
            BackoffStrategy::Exponential => {
                let nanos = (delay.as_nanos() as f64 * self.backoff_multiplier)
                    .min(self.max_delay.as_nanos() as f64);
                Duration::from_nanos(nanos as u64)
            }
            BackoffStrategy::Linear => (delay + self.initial_delay).min(self.max_delay),
        }
    }

    /// `base * (1 + j)` with `j` drawn uniformly from `[0, jitter_factor)`
    pub fn jittered_delay(&self, base: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let extra = base.as_nanos() as f64 * fastrand::f64() * self.jitter_factor;
        base + Duration::from_nanos(extra as u64)
    }
}

pub type RetryPredicate = Arc<dyn Fn(&ClientError) -> bool + Send + Sync>;

/// Counters describing the retry activity of a [`RetryManager`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u64,
    pub retries: u64,
    pub total_delay: Duration,
}

pub struct RetryManager {
    policy: RetryPolicy,
    predicate: Option<RetryPredicate>,
    attempts: AtomicU64,
    retries: AtomicU64,
    delay_nanos: AtomicU64,
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("policy", &self.policy)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            predicate: None,
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            delay_nanos: AtomicU64::new(0),
        }
    }

    /// Replace list-based classification with `predicate`
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ClientError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            total_delay: Duration::from_nanos(self.delay_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Whether `error` may be retried. A custom predicate, when installed, is
    /// used exclusively; otherwise the allow list is consulted, then the deny
    /// list, and anything unlisted is not retried. An open circuit is never
    /// retried: failover owns that decision.
    pub fn is_retryable(&self, error: &ClientError) -> bool {
        let kind = error.kind();
        if kind == ErrorKind::CircuitBreakerOpen {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            return predicate(error);
        }
        if self.policy.retry_on_errors.contains(&kind) {
            return true;
        }
        if self.policy.no_retry_errors.contains(&kind) {
            return false;
        }
        false
    }

    pub fn execute_with_retry<T, F>(&self, mut operation: F) -> ClientResult<T>
    where
        F: FnMut() -> ClientResult<T>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut delay = self.policy.base_delay(0);

        loop {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let error = match operation() {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                debug!(attempt = attempt, error = %error, "Error is not retryable");
                return Err(error);
            }

            if attempt.saturating_add(1) >= self.policy.max_attempts {
                warn!(
                    attempts = attempt + 1,
                    max_attempts = self.policy.max_attempts,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return Err(error);
            }

            let sleep_for = self.policy.jittered_delay(delay);
            if let Some(budget) = self.policy.retry_timeout {
                let elapsed = started.elapsed();
                if elapsed + sleep_for > budget {
                    warn!(
                        attempts = attempt + 1,
                        elapsed_ms = elapsed.as_millis() as u64,
                        budget_ms = budget.as_millis() as u64,
                        "Retry timeout reached"
                    );
                    return Err(ClientError::RetryExhausted {
                        attempts: attempt + 1,
                        elapsed,
                        last_error: error.to_string(),
                    });
                }
            }

            log_retry_attempt(attempt + 1, self.policy.max_attempts, sleep_for, &error);
            thread::sleep(sleep_for);
            self.retries.fetch_add(1, Ordering::Relaxed);
            self.delay_nanos
                .fetch_add(sleep_for.as_nanos() as u64, Ordering::Relaxed);

            delay = self.policy.next_delay(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    fn temporary() -> ClientError {
        ClientError::TemporaryFailure("busy".to_string())
    }

    #[test]
    fn test_exponential_base_delays() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            backoff: BackoffStrategy::Exponential,
            ..Default::default()
        };
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay(4), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_base_delays() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            backoff: BackoffStrategy::Linear,
            ..Default::default()
        };
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(250));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let manager = RetryManager::new(fast_policy(3));
        let calls = Cell::new(0);
        let result = manager.execute_with_retry(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(temporary())
            } else {
                Ok("done")
            }
        });
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.get(), 3);
        assert_eq!(manager.stats().retries, 2);
    }

    #[test]
    fn test_returns_last_error_when_attempts_exhausted() {
        let manager = RetryManager::new(fast_policy(2));
        let calls = Cell::new(0);
        let result: ClientResult<()> = manager.execute_with_retry(|| {
            calls.set(calls.get() + 1);
            Err(temporary())
        });
        assert_eq!(result, Err(temporary()));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_zero_max_attempts_runs_once() {
        let manager = RetryManager::new(fast_policy(0));
        let calls = Cell::new(0);
        let _: ClientResult<()> = manager.execute_with_retry(|| {
            calls.set(calls.get() + 1);
            Err(temporary())
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_deny_listed_error_returns_without_sleeping() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            retry_on_errors: vec![],
            no_retry_errors: vec![ErrorKind::CasMismatch],
            max_attempts: 10,
            ..Default::default()
        };
        let manager = RetryManager::new(policy);
        let started = Instant::now();
        let result: ClientResult<()> = manager.execute_with_retry(|| {
            Err(ClientError::CasMismatch {
                key: "k".to_string(),
            })
        });
        assert!(matches!(result, Err(ClientError::CasMismatch { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.stats().attempts, 1);
        assert_eq!(manager.stats().total_delay, Duration::ZERO);
    }

    #[test]
    fn test_unlisted_errors_are_not_retried() {
        let policy = RetryPolicy {
            retry_on_errors: vec![],
            no_retry_errors: vec![],
            ..fast_policy(5)
        };
        let manager = RetryManager::new(policy);
        assert!(!manager.is_retryable(&temporary()));
    }

    #[test]
    fn test_predicate_is_used_exclusively() {
        let manager = RetryManager::new(fast_policy(3))
            .with_predicate(|error| matches!(error, ClientError::DocumentNotFound { .. }));
        assert!(manager.is_retryable(&ClientError::DocumentNotFound {
            key: "k".to_string()
        }));
        assert!(!manager.is_retryable(&temporary()));
    }

    #[test]
    fn test_circuit_open_is_never_retried() {
        let manager = RetryManager::new(fast_policy(3)).with_predicate(|_| true);
        assert!(!manager.is_retryable(&ClientError::CircuitBreakerOpen {
            component: "cluster".to_string()
        }));
    }

    #[test]
    fn test_retry_timeout_bounds_total_time() {
        let policy = RetryPolicy {
            max_attempts: 100,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
            retry_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let manager = RetryManager::new(policy);
        let started = Instant::now();
        let result: ClientResult<()> = manager.execute_with_retry(|| Err(temporary()));
        match result {
            Err(ClientError::RetryExhausted { attempts, .. }) => assert!(attempts >= 2),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());

        let policy = RetryPolicy {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        let policy = RetryPolicy {
            retry_on_errors: vec![ErrorKind::Timeout],
            no_retry_errors: vec![ErrorKind::Timeout],
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}

mod common;

use common::strategies::*;
use docstore_client::resilience::{BackoffStrategy, RetryManager, RetryPolicy};
use docstore_client::ClientError;
use proptest::prelude::*;
use std::cell::Cell;
use std::time::Duration;

proptest! {
    /// Property: generated policies are valid configurations
    #[test]
    fn generated_policies_validate(policy in retry_policy_strategy()) {
        prop_assert!(policy.validate().is_ok());
    }

    /// Property: base delays never shrink and never exceed max_delay
    #[test]
    fn base_delay_is_monotonic_and_capped(policy in retry_policy_strategy()) {
        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            let delay = policy.base_delay(attempt);
            prop_assert!(delay >= previous, "attempt {} shrank: {:?} < {:?}", attempt, delay, previous);
            prop_assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    /// Property: linear backoff adds initial_delay per attempt up to the cap
    #[test]
    fn linear_backoff_steps_by_initial_delay(
        initial_ms in 1u64..200,
        max_factor in 1u64..10,
        attempt in 0u32..15,
    ) {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(initial_ms * max_factor),
            backoff: BackoffStrategy::Linear,
            ..Default::default()
        };
        let expected = Duration::from_millis(initial_ms * (u64::from(attempt) + 1)).min(policy.max_delay);
        prop_assert_eq!(policy.base_delay(attempt), expected);
    }

    /// Property: jitter only ever lengthens a delay, by at most jitter_factor
    #[test]
    fn jitter_stays_within_factor(policy in retry_policy_strategy(), base_ms in 0u64..10_000) {
        let base = Duration::from_millis(base_ms);
        let jittered = policy.jittered_delay(base);
        let upper = base.as_nanos() as f64 * (1.0 + policy.jitter_factor);
        prop_assert!(jittered >= base);
        prop_assert!(jittered.as_nanos() as f64 <= upper + 1.0);
    }

    /// Property: an always-failing retryable operation runs max(max_attempts, 1) times
    #[test]
    fn retryable_failures_run_exactly_max_attempts(max_attempts in 0u32..8) {
        let manager = RetryManager::new(RetryPolicy {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Default::default()
        });
        let calls = Cell::new(0u32);
        let result: Result<(), ClientError> = manager.execute_with_retry(|| {
            calls.set(calls.get() + 1);
            Err(ClientError::TemporaryFailure("busy".to_string()))
        });
        prop_assert!(result.is_err());
        prop_assert_eq!(calls.get(), max_attempts.max(1));
    }

    /// Property: errors on neither list are never retried
    #[test]
    fn unlisted_errors_are_not_retried(max_attempts in 1u32..8) {
        let manager = RetryManager::new(RetryPolicy {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retry_on_errors: Vec::new(),
            no_retry_errors: Vec::new(),
            ..Default::default()
        });
        let calls = Cell::new(0u32);
        let _ = manager.execute_with_retry(|| -> Result<(), ClientError> {
            calls.set(calls.get() + 1);
            Err(ClientError::QueryFailed("syntax error".to_string()))
        });
        prop_assert_eq!(calls.get(), 1);
    }
}

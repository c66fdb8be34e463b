use docstore_client::resilience::{BackoffStrategy, RetryPolicy};
use proptest::prelude::*;
use std::time::Duration;

pub fn backoff_strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![Just(BackoffStrategy::Exponential), Just(BackoffStrategy::Linear)]
}

/// Policies that pass `RetryPolicy::validate`
pub fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (
        1u32..10,
        1u64..500,
        1u64..20,
        1.0f64..4.0,
        0.0f64..=1.0,
        backoff_strategy(),
    )
        .prop_map(
            |(max_attempts, initial_ms, max_factor, backoff_multiplier, jitter_factor, backoff)| RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(initial_ms * max_factor),
                backoff_multiplier,
                jitter_factor,
                backoff,
                ..Default::default()
            },
        )
}

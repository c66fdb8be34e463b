//! # Structured Logging Module
//!
//! Environment-aware structured logging for client operations. Pool, retry,
//! failover and transaction activity is emitted as structured `tracing` events
//! so it can be filtered by field in production.
//!
//! The level follows the environment (`DOCSTORE_ENV`, then `APP_ENV`) unless
//! `RUST_LOG` is set. `DOCSTORE_LOG_FORMAT=json` switches console output to JSON.

use crate::error::ClientError;
use chrono::Utc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));

        let layer = if json_output() {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(filter)
                .boxed()
        };

        // An application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("DOCSTORE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn json_output() -> bool {
    std::env::var("DOCSTORE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log structured data for connection pool operations
pub fn log_pool_operation(
    operation: &str,
    connection_id: Option<&str>,
    active: usize,
    idle: usize,
    details: Option<&str>,
) {
    tracing::debug!(
        operation = %operation,
        connection_id = connection_id,
        active = active,
        idle = idle,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🏊 POOL_OPERATION"
    );
}

/// Log a retry decision after a failed attempt
pub fn log_retry_attempt(attempt: u32, max_attempts: u32, delay: Duration, error: &ClientError) {
    tracing::warn!(
        attempt = attempt,
        max_attempts = max_attempts,
        delay_ms = delay.as_millis() as u64,
        error_kind = %error.kind(),
        error = %error,
        timestamp = %Utc::now().to_rfc3339(),
        "🔁 RETRY_ATTEMPT"
    );
}

/// Log an endpoint change or failover outcome
pub fn log_failover_event(event: &str, from: Option<&str>, to: Option<&str>, details: Option<&str>) {
    tracing::warn!(
        event = %event,
        from = from,
        to = to,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔀 FAILOVER_EVENT"
    );
}

/// Log structured data for transaction operations
pub fn log_transaction_operation(
    transaction_id: &str,
    operation: &str,
    key: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        transaction_id = %transaction_id,
        operation = %operation,
        key = key,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TRANSACTION_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detection() {
        std::env::set_var("DOCSTORE_ENV", "test_override");
        let env = get_environment();
        assert_eq!(env, "test_override");
        std::env::remove_var("DOCSTORE_ENV");
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_repeated_initialization_is_harmless() {
        init_structured_logging();
        init_structured_logging();
        log_retry_attempt(
            1,
            3,
            Duration::from_millis(10),
            &ClientError::Timeout("read".to_string()),
        );
    }
}

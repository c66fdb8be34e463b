//! Error types for the document store client.
//!

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    // Store outcomes
    #[error("Document not found: {key}")]
    DocumentNotFound { key: String },
    #[error("Document already exists: {key}")]
    DocumentExists { key: String },
    #[error("CAS mismatch for document: {key}")]
    CasMismatch { key: String },
    #[error("Document is locked: {key}")]
    DocumentLocked { key: String },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Query failed: {0}")]
    QueryFailed(String),

    // Pool
    #[error("Connection pool exhausted ({max_connections} connections in use)")]
    ConnectionPoolExhausted { max_connections: usize },
    #[error("Connection validation failed: {0}")]
    ConnectionValidationFailed(String),
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    // Retry and failover
    #[error("Retry budget exhausted after {attempts} attempts in {elapsed:?}: {last_error}")]
    RetryExhausted {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
    #[error("Circuit breaker is open for {component}")]
    CircuitBreakerOpen { component: String },
    #[error("Failover exhausted after {attempts} attempts")]
    FailoverExhausted { attempts: u32 },
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Temporary failure: {0}")]
    TemporaryFailure(String),
    #[error("Network error: {0}")]
    NetworkError(String),

    // Transactions
    #[error("Transaction is not active (state: {state})")]
    TransactionNotActive { state: String },
    #[error("Transaction failed at {operation} on {key}: {reason}")]
    TransactionFailed {
        operation: String,
        key: String,
        reason: String,
    },
    #[error("Rollback of {operation} on {key} failed: {reason}")]
    TransactionRollbackFailed {
        operation: String,
        key: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Fieldless classification of [`ClientError`], used by retry allow/deny lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DocumentNotFound,
    DocumentExists,
    CasMismatch,
    DocumentLocked,
    InvalidArgument,
    QueryFailed,
    ConnectionPoolExhausted,
    ConnectionValidationFailed,
    ConnectionFailed,
    RetryExhausted,
    CircuitBreakerOpen,
    FailoverExhausted,
    Timeout,
    TemporaryFailure,
    NetworkError,
    TransactionNotActive,
    TransactionFailed,
    TransactionRollbackFailed,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::DocumentNotFound { .. } => ErrorKind::DocumentNotFound,
            ClientError::DocumentExists { .. } => ErrorKind::DocumentExists,
            ClientError::CasMismatch { .. } => ErrorKind::CasMismatch,
            ClientError::DocumentLocked { .. } => ErrorKind::DocumentLocked,
            ClientError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ClientError::QueryFailed(_) => ErrorKind::QueryFailed,
            ClientError::ConnectionPoolExhausted { .. } => ErrorKind::ConnectionPoolExhausted,
            ClientError::ConnectionValidationFailed(_) => ErrorKind::ConnectionValidationFailed,
            ClientError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            ClientError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            ClientError::CircuitBreakerOpen { .. } => ErrorKind::CircuitBreakerOpen,
            ClientError::FailoverExhausted { .. } => ErrorKind::FailoverExhausted,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::TemporaryFailure(_) => ErrorKind::TemporaryFailure,
            ClientError::NetworkError(_) => ErrorKind::NetworkError,
            ClientError::TransactionNotActive { .. } => ErrorKind::TransactionNotActive,
            ClientError::TransactionFailed { .. } => ErrorKind::TransactionFailed,
            ClientError::TransactionRollbackFailed { .. } => ErrorKind::TransactionRollbackFailed,
            ClientError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Errors that say something about the health of the endpoint rather than
    /// the request. These are reported to the failover manager.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NetworkError
                | ErrorKind::Timeout
                | ErrorKind::TemporaryFailure
                | ErrorKind::ConnectionFailed
                | ErrorKind::ConnectionValidationFailed
        )
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = ClientError::DocumentExists {
            key: "k2".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::DocumentExists);
        assert!(!err.is_endpoint_failure());

        let err = ClientError::NetworkError("connection reset".to_string());
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(err.is_endpoint_failure());
    }

    #[test]
    fn test_error_kind_serde_names() {
        let kinds: Vec<ErrorKind> =
            serde_json::from_str(r#"["temporary_failure", "cas_mismatch"]"#).unwrap();
        assert_eq!(kinds, vec![ErrorKind::TemporaryFailure, ErrorKind::CasMismatch]);
    }

    #[test]
    fn test_display_messages() {
        let err = ClientError::ConnectionPoolExhausted { max_connections: 4 };
        assert_eq!(
            err.to_string(),
            "Connection pool exhausted (4 connections in use)"
        );
        let err = ClientError::TransactionNotActive {
            state: "committed".to_string(),
        };
        assert_eq!(err.to_string(), "Transaction is not active (state: committed)");
    }
}

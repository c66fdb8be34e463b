//! # Compensating Transactions
//!
//! Client-side pseudo-transactions over a [`StoreClient`](crate::store::StoreClient).
//! Operations are buffered in a [`TransactionContext`], executed in order, and
//! undone with inverse operations when a later one fails. This is not an ACID
//! transaction: other clients can observe intermediate states, and a
//! compensation can itself fail. Failed compensations are reported in
//! [`TransactionResult::rollback_errors`] rather than dropped.
//!
//! ```rust,no_run
//! use docstore_client::store::InMemoryStore;
//! use docstore_client::transaction::{TransactionConfig, TransactionEngine};
//! use std::sync::Arc;
//!
//! let engine = TransactionEngine::new(Arc::new(InMemoryStore::new()), TransactionConfig::default());
//! let mut tx = engine.begin();
//! tx.add_upsert_operation("k1", "v1")?;
//! tx.add_insert_operation("k2", "v2")?;
//! let result = tx.commit()?;
//! assert!(result.success);
//! # Ok::<(), docstore_client::ClientError>(())
//! ```

mod context;
mod engine;
mod operation;

pub use context::TransactionContext;
pub use engine::TransactionEngine;
pub use operation::{OperationKind, OperationType, PriorState, TransactionOperation};

use crate::error::{ClientError, ClientResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Undo executed operations when one fails during `commit`
    pub auto_rollback: bool,

    /// Read each document before mutating it so its compensation can restore
    /// the prior value. Disabling it saves a round trip per mutation but
    /// leaves replace, remove and touch without a compensation.
    pub snapshot_prior_state: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            auto_rollback: true,
            snapshot_prior_state: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionState::Active)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "active"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled_back"),
            TransactionState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of `commit` or `rollback`. A failed transaction is reported here
/// rather than as an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    pub transaction_id: Uuid,
    pub success: bool,
    pub operations_executed: usize,
    pub operations_rolled_back: usize,
    pub error_message: Option<String>,
    /// The forward failure, as `TransactionFailed`
    pub error: Option<ClientError>,
    /// One `TransactionRollbackFailed` per compensation that did not apply
    pub rollback_errors: Vec<ClientError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl TransactionResult {
    pub fn has_rollback_errors(&self) -> bool {
        !self.rollback_errors.is_empty()
    }

    /// `Ok` for a successful transaction. A failed one becomes its forward
    /// error, or the first rollback error when only compensation failed.
    pub fn into_result(self) -> ClientResult<TransactionResult> {
        if self.success {
            return Ok(self);
        }
        if let Some(error) = self.error.clone() {
            return Err(error);
        }
        match self.rollback_errors.first() {
            Some(error) => Err(error.clone()),
            None => Err(ClientError::TransactionFailed {
                operation: "commit".to_string(),
                key: String::new(),
                reason: self
                    .error_message
                    .unwrap_or_else(|| "transaction failed".to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool) -> TransactionResult {
        let now = Utc::now();
        TransactionResult {
            transaction_id: Uuid::new_v4(),
            success,
            operations_executed: 1,
            operations_rolled_back: 0,
            error_message: None,
            error: None,
            rollback_errors: Vec::new(),
            started_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn test_into_result_prefers_forward_error() {
        let forward = ClientError::TransactionFailed {
            operation: "insert".to_string(),
            key: "k2".to_string(),
            reason: "exists".to_string(),
        };
        let rollback = ClientError::TransactionRollbackFailed {
            operation: "remove".to_string(),
            key: "k1".to_string(),
            reason: "cas mismatch".to_string(),
        };

        let mut failed = result(false);
        failed.error = Some(forward.clone());
        failed.rollback_errors.push(rollback.clone());
        assert_eq!(failed.into_result().unwrap_err(), forward);

        let mut rollback_only = result(false);
        rollback_only.rollback_errors.push(rollback.clone());
        assert_eq!(rollback_only.into_result().unwrap_err(), rollback);

        assert!(result(true).into_result().is_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::RolledBack.to_string(), "rolled_back");
        assert!(TransactionState::Committed.is_terminal());
        assert!(!TransactionState::Active.is_terminal());
    }
}

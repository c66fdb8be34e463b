//! Transaction context state machine.
//!
//! `active -> committed | rolled_back | failed`. Only an active context accepts
//! operations, `execute`, `commit` or `rollback`; terminal states are final.
//!
//! A context is single-writer: every mutating method takes `&mut self`, so
//! sharing one between threads requires the caller's own synchronization.

use super::operation::{PriorState, TransactionOperation};
use super::{TransactionConfig, TransactionResult, TransactionState};
use crate::error::{ClientError, ClientResult};
use crate::logging::log_transaction_operation;
use crate::store::{Cas, QueryOptions, StoreClient};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub struct TransactionContext<S: StoreClient> {
    id: Uuid,
    client: Arc<S>,
    config: TransactionConfig,
    operations: Vec<TransactionOperation>,
    rollback_operations: Vec<TransactionOperation>,
    /// CAS of this transaction's latest write to each key
    written: HashMap<String, Cas>,
    /// `operations[..executed]` have run successfully
    executed: usize,
    state: TransactionState,
    started_at: DateTime<Utc>,
}

impl<S: StoreClient> TransactionContext<S> {
    pub(crate) fn new(client: Arc<S>, config: TransactionConfig) -> Self {
        let id = Uuid::new_v4();
        log_transaction_operation(&id.to_string(), "begin", None, "active", None);
        Self {
            id,
            client,
            config,
            operations: Vec::new(),
            rollback_operations: Vec::new(),
            written: HashMap::new(),
            executed: 0,
            state: TransactionState::Active,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn operations(&self) -> &[TransactionOperation] {
        &self.operations
    }

    /// Compensations recorded so far, in the order their forward operations ran
    pub fn pending_compensations(&self) -> &[TransactionOperation] {
        &self.rollback_operations
    }

    pub fn executed_count(&self) -> usize {
        self.executed
    }

    fn ensure_active(&self) -> ClientResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ClientError::TransactionNotActive {
                state: self.state.to_string(),
            })
        }
    }

    pub fn add_operation(&mut self, operation: TransactionOperation) -> ClientResult<()> {
        self.ensure_active()?;
        debug!(
            transaction_id = %self.id,
            operation = %operation.operation_type(),
            key = %operation.key,
            "Operation added to transaction"
        );
        self.operations.push(operation);
        Ok(())
    }

    pub fn add_get_operation(&mut self, key: impl Into<String>) -> ClientResult<()> {
        self.add_operation(TransactionOperation::get(key))
    }

    pub fn add_insert_operation(&mut self, key: impl Into<String>, value: impl Into<Value>) -> ClientResult<()> {
        self.add_operation(TransactionOperation::insert(key, value))
    }

    pub fn add_upsert_operation(&mut self, key: impl Into<String>, value: impl Into<Value>) -> ClientResult<()> {
        self.add_operation(TransactionOperation::upsert(key, value))
    }

    pub fn add_replace_operation(&mut self, key: impl Into<String>, value: impl Into<Value>) -> ClientResult<()> {
        self.add_operation(TransactionOperation::replace(key, value))
    }

    pub fn add_remove_operation(&mut self, key: impl Into<String>) -> ClientResult<()> {
        self.add_operation(TransactionOperation::remove(key))
    }

    pub fn add_increment_operation(&mut self, key: impl Into<String>, delta: u64) -> ClientResult<()> {
        self.add_operation(TransactionOperation::increment(key, delta))
    }

    pub fn add_decrement_operation(&mut self, key: impl Into<String>, delta: u64) -> ClientResult<()> {
        self.add_operation(TransactionOperation::decrement(key, delta))
    }

    pub fn add_touch_operation(&mut self, key: impl Into<String>, expiry: Option<Duration>) -> ClientResult<()> {
        self.add_operation(TransactionOperation::touch(key, expiry))
    }

    pub fn add_unlock_operation(&mut self, key: impl Into<String>, cas: Cas) -> ClientResult<()> {
        self.add_operation(TransactionOperation::unlock(key, cas))
    }

    pub fn add_query_operation(&mut self, statement: impl Into<String>, options: QueryOptions) -> ClientResult<()> {
        self.add_operation(TransactionOperation::query(statement, options))
    }

    /// Run operations added since the last call, keeping the context active.
    /// Stops at the first failure and returns it as `TransactionFailed`; the
    /// operations that ran keep their compensations for a later `rollback`.
    pub fn execute(&mut self) -> ClientResult<usize> {
        self.ensure_active()?;
        let before = self.executed;
        self.run_pending()?;
        Ok(self.executed - before)
    }

    fn run_pending(&mut self) -> ClientResult<()> {
        while self.executed < self.operations.len() {
            let index = self.executed;
            let prior = self.snapshot(&self.operations[index])?;

            let operation = &mut self.operations[index];
            if let Err(cause) = operation.apply(self.client.as_ref()) {
                return Err(self.forward_failure(index, &cause));
            }

            let operation = &self.operations[index];
            if let (true, Some(cas)) = (operation.kind.is_mutation(), operation.result_cas) {
                self.written.insert(operation.key.clone(), cas);
            }
            match operation.compensation(prior.as_ref()) {
                Some(compensation) => self.rollback_operations.push(compensation),
                None if operation.kind.needs_snapshot() => warn!(
                    transaction_id = %self.id,
                    operation = %operation.operation_type(),
                    key = %operation.key,
                    "No compensation available without a prior-state snapshot"
                ),
                None => {}
            }
            log_transaction_operation(
                &self.id.to_string(),
                &operation.operation_type().to_string(),
                Some(&operation.key),
                "executed",
                None,
            );
            self.executed += 1;
        }
        Ok(())
    }

    fn snapshot(&self, operation: &TransactionOperation) -> ClientResult<Option<PriorState>> {
        if !self.config.snapshot_prior_state || !operation.kind.needs_snapshot() {
            return Ok(None);
        }
        PriorState::capture(self.client.as_ref(), &operation.key)
            .map(Some)
            .map_err(|cause| {
                ClientError::TransactionFailed {
                    operation: operation.operation_type().to_string(),
                    key: operation.key.clone(),
                    reason: format!("prior-state snapshot failed: {cause}"),
                }
            })
    }

    fn forward_failure(&self, index: usize, cause: &ClientError) -> ClientError {
        let operation = &self.operations[index];
        log_transaction_operation(
            &self.id.to_string(),
            &operation.operation_type().to_string(),
            Some(&operation.key),
            "failed",
            Some(&cause.to_string()),
        );
        ClientError::TransactionFailed {
            operation: operation.operation_type().to_string(),
            key: operation.key.clone(),
            reason: cause.to_string(),
        }
    }

    /// Run every remaining operation. A failure never surfaces as `Err`: it is
    /// captured in the result, after compensating when `auto_rollback` is set.
    /// `Err` is returned only when the context is no longer active.
    pub fn commit(&mut self) -> ClientResult<TransactionResult> {
        self.ensure_active()?;

        match self.run_pending() {
            Ok(()) => {
                self.state = TransactionState::Committed;
                log_transaction_operation(&self.id.to_string(), "commit", None, "committed", None);
                Ok(self.result(true, 0, None, Vec::new()))
            }
            Err(failure) => {
                let (rolled_back, rollback_errors) = if self.config.auto_rollback {
                    self.compensate()
                } else {
                    (0, Vec::new())
                };
                self.state = TransactionState::Failed;
                log_transaction_operation(
                    &self.id.to_string(),
                    "commit",
                    None,
                    "failed",
                    Some(&failure.to_string()),
                );
                Ok(self.result(false, rolled_back, Some(failure), rollback_errors))
            }
        }
    }

    /// Undo every executed operation, latest first, and close the context
    pub fn rollback(&mut self) -> ClientResult<TransactionResult> {
        self.ensure_active()?;
        let (rolled_back, rollback_errors) = self.compensate();
        self.state = TransactionState::RolledBack;
        log_transaction_operation(
            &self.id.to_string(),
            "rollback",
            None,
            "rolled_back",
            Some(&format!("{rolled_back} compensations applied")),
        );
        let success = rollback_errors.is_empty();
        Ok(self.result(success, rolled_back, None, rollback_errors))
    }

    /// Apply recorded compensations in reverse order. A failing compensation
    /// is recorded and the rest still run.
    ///
    /// Compensation guards are chained per key: each one expects the CAS of
    /// this transaction's latest write to the key, whether that was a forward
    /// operation or an earlier compensation. A write by anyone else still
    /// breaks the chain.
    fn compensate(&mut self) -> (usize, Vec<ClientError>) {
        let mut rolled_back = 0;
        let mut errors = Vec::new();

        while let Some(mut compensation) = self.rollback_operations.pop() {
            if let Some(cas) = self.written.get(&compensation.key) {
                compensation.rebase_cas(*cas);
            }
            match compensation.apply(self.client.as_ref()) {
                Ok(()) => {
                    rolled_back += 1;
                    if let (true, Some(cas)) =
                        (compensation.kind.is_mutation(), compensation.result_cas)
                    {
                        self.written.insert(compensation.key.clone(), cas);
                    }
                    log_transaction_operation(
                        &self.id.to_string(),
                        &compensation.operation_type().to_string(),
                        Some(&compensation.key),
                        "compensated",
                        None,
                    );
                }
                Err(cause) => {
                    error!(
                        transaction_id = %self.id,
                        operation = %compensation.operation_type(),
                        key = %compensation.key,
                        error = %cause,
                        "Compensation failed"
                    );
                    errors.push(ClientError::TransactionRollbackFailed {
                        operation: compensation.operation_type().to_string(),
                        key: compensation.key.clone(),
                        reason: cause.to_string(),
                    });
                }
            }
        }
        (rolled_back, errors)
    }

    fn result(
        &self,
        success: bool,
        operations_rolled_back: usize,
        error: Option<ClientError>,
        rollback_errors: Vec<ClientError>,
    ) -> TransactionResult {
        let error_message = error
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| rollback_errors.first().map(ToString::to_string));
        TransactionResult {
            transaction_id: self.id,
            success,
            operations_executed: self.executed,
            operations_rolled_back,
            error_message,
            error,
            rollback_errors,
            started_at: self.started_at,
            completed_at: Utc::now(),
        }
    }
}

impl<S: StoreClient> fmt::Debug for TransactionContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("operations", &self.operations.len())
            .field("executed", &self.executed)
            .field("compensations", &self.rollback_operations.len())
            .finish()
    }
}

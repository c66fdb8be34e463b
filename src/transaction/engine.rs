use super::{TransactionConfig, TransactionContext};
use crate::store::StoreClient;
use std::fmt;
use std::sync::Arc;

/// Starts transactions against one store client
pub struct TransactionEngine<S: StoreClient> {
    client: Arc<S>,
    config: TransactionConfig,
}

impl<S: StoreClient> TransactionEngine<S> {
    pub fn new(client: Arc<S>, config: TransactionConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<S> {
        &self.client
    }

    /// A new context in the `active` state with no operations
    pub fn begin(&self) -> TransactionContext<S> {
        TransactionContext::new(Arc::clone(&self.client), self.config.clone())
    }

    /// [`begin`](Self::begin) with a per-transaction configuration
    pub fn begin_with(&self, config: TransactionConfig) -> TransactionContext<S> {
        TransactionContext::new(Arc::clone(&self.client), config)
    }
}

impl<S: StoreClient> Clone for TransactionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            config: self.config.clone(),
        }
    }
}

impl<S: StoreClient> fmt::Debug for TransactionEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::transaction::TransactionState;

    #[test]
    fn test_begin_creates_independent_active_contexts() {
        let engine = TransactionEngine::new(Arc::new(InMemoryStore::new()), TransactionConfig::default());
        let first = engine.begin();
        let second = engine.begin();
        assert_eq!(first.state(), TransactionState::Active);
        assert!(first.operations().is_empty());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_begin_with_overrides_config() {
        let engine = TransactionEngine::new(Arc::new(InMemoryStore::new()), TransactionConfig::default());
        let tx = engine.begin_with(TransactionConfig {
            auto_rollback: false,
            snapshot_prior_state: true,
        });
        assert!(!tx.config().auto_rollback);
    }
}

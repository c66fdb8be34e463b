//! # Client
//!
//! Composes the connection pool, retry manager, failover manager and prepared
//! statement cache into a single [`StoreClient`].
//!
//! Each call is wrapped by the retry manager. An attempt checks the failover
//! circuit, borrows a pooled connection bound to the current endpoint and runs
//! the store call on it. Endpoint failures (network errors, timeouts,
//! temporary failures) invalidate the connection and are reported to the
//! failover manager; when that rotates the endpoint the pool's idle
//! connections are cleared so the next attempt connects to the new endpoint.

mod statement_cache;

pub use statement_cache::{QueryCacheConfig, StatementCache, StatementCacheStats};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::logging::{log_error, log_failover_event};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolStats};
use crate::resilience::{Endpoint, FailoverManager, FailoverStats, RetryManager, RetryStats};
use crate::store::{
    Cas, CounterOptions, CounterResult, GetResult, MutationResult, QueryOptions, QueryResult,
    RemoveOptions, StoreClient, StoreMode, StoreOptions,
};
use crate::transaction::TransactionEngine;
use crate::utils::PeriodicTask;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Opens store connections to a cluster endpoint
pub trait EndpointConnector: Send + Sync + 'static {
    type Store: StoreClient + 'static;

    fn connect(&self, endpoint: &Endpoint) -> ClientResult<Self::Store>;

    /// Whether an open connection is still usable
    fn ping(&self, store: &Self::Store) -> bool {
        store.ping().is_ok()
    }
}

/// A store connection and the endpoint it was opened against
pub struct EndpointConnection<S> {
    endpoint: Endpoint,
    store: S,
}

impl<S> EndpointConnection<S> {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Pool factory that connects to whichever endpoint failover currently selects
pub struct EndpointFactory<C: EndpointConnector> {
    connector: Arc<C>,
    failover: Arc<FailoverManager>,
}

impl<C: EndpointConnector> ConnectionFactory for EndpointFactory<C> {
    type Handle = EndpointConnection<C::Store>;

    fn connect(&self) -> ClientResult<Self::Handle> {
        let endpoint = self.failover.get_current_endpoint();
        debug!(endpoint = %endpoint, "Opening store connection");
        let store = self.connector.connect(&endpoint)?;
        Ok(EndpointConnection { endpoint, store })
    }

    /// A connection to an endpoint failover has moved away from is stale
    fn validate(&self, handle: &Self::Handle) -> bool {
        handle.endpoint == self.failover.get_current_endpoint() && self.connector.ping(&handle.store)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStats {
    pub pool: PoolStats,
    pub failover: FailoverStats,
    pub retry_attempts: u64,
    pub retries: u64,
    pub statements: StatementCacheStats,
}

pub struct Client<C: EndpointConnector> {
    config: ClientConfig,
    pool: ConnectionPool<EndpointFactory<C>>,
    retry: RetryManager,
    failover: Arc<FailoverManager>,
    statements: StatementCache,
    background: Mutex<Vec<PeriodicTask>>,
}

impl<C: EndpointConnector> Client<C> {
    pub fn new(config: ClientConfig, connector: C) -> ClientResult<Self> {
        config.validate()?;
        let connector = Arc::new(connector);

        let mut failover = FailoverManager::new(config.failover.clone(), config.endpoints.clone())?;
        if config.failover.health_check_enabled {
            let probe_connector = Arc::clone(&connector);
            failover = failover.with_health_probe(move |endpoint: &Endpoint| {
                probe_connector
                    .connect(endpoint)
                    .map(|store| probe_connector.ping(&store))
                    .unwrap_or(false)
            });
        }
        let failover = Arc::new(failover);

        let pool = ConnectionPool::new(
            EndpointFactory {
                connector,
                failover: Arc::clone(&failover),
            },
            config.pool.clone(),
        )?;

        info!(
            endpoints = config.endpoints.len(),
            max_connections = config.pool.max_connections,
            retry_max_attempts = config.retry.max_attempts,
            "Document store client created"
        );

        Ok(Self {
            retry: RetryManager::new(config.retry.clone()),
            statements: StatementCache::new(config.query_cache.clone()),
            pool,
            failover,
            background: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Pre-create `min_connections` and start pool maintenance and endpoint
    /// health monitoring where configured. Background threads stop when the
    /// client is dropped.
    pub fn start(&self) -> ClientResult<()> {
        self.pool.initialize()?;
        let mut background = self.background.lock();
        if !background.is_empty() {
            return Ok(());
        }
        if let Some(task) = self.pool.start_maintenance()? {
            background.push(task);
        }
        if let Some(task) = self.failover.start_health_monitor()? {
            background.push(task);
        }
        Ok(())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool<EndpointFactory<C>> {
        &self.pool
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    pub fn stats(&self) -> ClientStats {
        let RetryStats { attempts, retries, .. } = self.retry.stats();
        ClientStats {
            pool: self.pool.stats(),
            failover: self.failover.stats(),
            retry_attempts: attempts,
            retries,
            statements: self.statements.stats(),
        }
    }

    /// Transactions issued through this client, and so through its pool,
    /// retry and failover policies
    pub fn transactions(self: &Arc<Self>) -> TransactionEngine<Self> {
        TransactionEngine::new(Arc::clone(self), self.config.transaction.clone())
    }

    fn run<T, F>(&self, operation: &str, key: &str, mut call: F) -> ClientResult<T>
    where
        F: FnMut(&C::Store) -> ClientResult<T>,
    {
        self.retry.execute_with_retry(|| {
            self.failover.ensure_available()?;

            let mut conn = match self.pool.borrow() {
                Ok(conn) => conn,
                Err(error) => {
                    if error.is_endpoint_failure() {
                        self.report_endpoint_failure(operation, key, &error);
                    } else {
                        self.failover.release_request();
                    }
                    return Err(error);
                }
            };

            let result = {
                let _active = self.failover.begin_operation();
                call(&conn.store)
            };
            match &result {
                Err(error) if error.is_endpoint_failure() => {
                    conn.invalidate();
                    drop(conn);
                    self.report_endpoint_failure(operation, key, error);
                }
                _ => self.failover.record_success(),
            }
            result
        })
    }

    fn report_endpoint_failure(&self, operation: &str, key: &str, error: &ClientError) {
        log_error("client", operation, &error.to_string(), Some(key));
        let before = self.failover.get_current_endpoint();
        match self.failover.handle_failure() {
            Ok(next) if next != before => {
                let cleared = self.pool.clear();
                log_failover_event(
                    "pool_cleared",
                    Some(&before.address),
                    Some(&next.address),
                    Some(&format!("{cleared} idle connections closed")),
                );
            }
            Ok(_) => {}
            Err(failover_error) => {
                debug!(error = %failover_error, "Failover declined after endpoint failure");
            }
        }
    }

    fn execute_prepared(&self, statement: &str, options: &QueryOptions) -> ClientResult<QueryResult> {
        let name = self
            .statements
            .get_or_prepare(statement, |stmt| self.run("prepare", stmt, |store| store.prepare(stmt)))?;
        let execute = format!("EXECUTE {name}");
        let result = self.run("query", statement, |store| store.query(&execute, options));
        if let Err(ClientError::QueryFailed(_)) = &result {
            // The plan may have been dropped by the cluster; prepare again next time
            self.statements.evict(statement);
        }
        result
    }
}

impl<C: EndpointConnector> StoreClient for Client<C> {
    fn get(&self, key: &str) -> ClientResult<GetResult> {
        self.run("get", key, |store| store.get(key))
    }

    fn store(
        &self,
        key: &str,
        value: Value,
        mode: StoreMode,
        options: &StoreOptions,
    ) -> ClientResult<MutationResult> {
        self.run(&mode.to_string(), key, |store| {
            store.store(key, value.clone(), mode, options)
        })
    }

    fn remove(&self, key: &str, options: &RemoveOptions) -> ClientResult<MutationResult> {
        self.run("remove", key, |store| store.remove(key, options))
    }

    fn counter(&self, key: &str, delta: i64, options: &CounterOptions) -> ClientResult<CounterResult> {
        self.run("counter", key, |store| store.counter(key, delta, options))
    }

    fn touch(&self, key: &str, expiry: Option<Duration>) -> ClientResult<MutationResult> {
        self.run("touch", key, |store| store.touch(key, expiry))
    }

    fn unlock(&self, key: &str, cas: Cas) -> ClientResult<()> {
        self.run("unlock", key, |store| store.unlock(key, cas))
    }

    fn query(&self, statement: &str, options: &QueryOptions) -> ClientResult<QueryResult> {
        if options.adhoc {
            self.run("query", statement, |store| store.query(statement, options))
        } else {
            self.execute_prepared(statement, options)
        }
    }

    fn ping(&self) -> ClientResult<()> {
        self.run("ping", "", |store| store.ping())
    }

    fn prepare(&self, statement: &str) -> ClientResult<String> {
        self.statements
            .get_or_prepare(statement, |stmt| self.run("prepare", stmt, |store| store.prepare(stmt)))
    }
}

impl<C: EndpointConnector> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("current_endpoint", &self.failover.get_current_endpoint())
            .field("pool", &self.pool.stats())
            .field("circuit_state", &self.failover.circuit_state())
            .finish()
    }
}

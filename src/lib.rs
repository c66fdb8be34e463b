#![allow(clippy::doc_markdown)] // Allow technical terms like CAS, TTL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Docstore Client
//!
//! Resilience and compensating-transaction layer for clustered document stores.
//!
//! ## Overview
//!
//! The individual key/value and query calls are delegated to a synchronous
//! [`StoreClient`] implementation. This crate wraps those calls with the
//! policies a production client needs:
//!
//! - **Connection pooling**: a bounded pool with validation, idle eviction and
//!   a background maintenance sweep
//! - **Retries**: exponential or linear backoff with jitter and error
//!   classification
//! - **Failover**: a circuit breaker per cluster and endpoint rotation by
//!   round robin, least connections, smooth weighted round robin or random
//! - **Compensating transactions**: buffered operations executed in order and
//!   undone in reverse when one fails
//!
//! ## Module Organization
//!
//! - [`client`] - [`Client`], composing everything below into a `StoreClient`
//! - [`pool`] - Connection pool and pooled connection guard
//! - [`resilience`] - Retry manager, circuit breaker and failover manager
//! - [`transaction`] - Transaction engine and contexts
//! - [`store`] - Store client boundary and an in-memory store
//! - [`config`] - Layered configuration loading
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docstore_client::client::{Client, EndpointConnector};
//! use docstore_client::resilience::Endpoint;
//! use docstore_client::store::{InMemoryStore, StoreClient, StoreMode, StoreOptions};
//! use docstore_client::{ClientConfig, ClientResult};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct LocalConnector(Arc<InMemoryStore>);
//!
//! impl EndpointConnector for LocalConnector {
//!     type Store = Arc<InMemoryStore>;
//!
//!     fn connect(&self, _endpoint: &Endpoint) -> ClientResult<Self::Store> {
//!         Ok(Arc::clone(&self.0))
//!     }
//! }
//!
//! # fn main() -> ClientResult<()> {
//! docstore_client::logging::init_structured_logging();
//!
//! let config = ClientConfig {
//!     endpoints: vec![Endpoint::new("node-a:11210")],
//!     ..Default::default()
//! };
//! let client = Arc::new(Client::new(config, LocalConnector(Arc::new(InMemoryStore::new())))?);
//! client.start()?;
//!
//! client.store("user::1", json!({"name": "Ada"}), StoreMode::Upsert, &StoreOptions::default())?;
//!
//! let mut tx = client.transactions().begin();
//! tx.add_replace_operation("user::1", json!({"name": "Ada", "active": true}))?;
//! tx.add_increment_operation("users::active", 1)?;
//! let result = tx.commit()?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod resilience;
pub mod store;
pub mod transaction;
pub mod utils;

pub use client::{Client, ClientStats, EndpointConnector};
pub use config::{ClientConfig, ConfigManager, ConfigurationError};
pub use error::{ClientError, ClientResult, ErrorKind};
pub use pool::{ConnectionPool, ConnectionPoolConfig, PooledConnection};
pub use resilience::{
    CircuitBreaker, CircuitState, Endpoint, FailoverConfig, FailoverManager, LoadBalancingStrategy,
    RetryManager, RetryPolicy,
};
pub use store::{StoreClient, StoreMode};
pub use transaction::{
    TransactionConfig, TransactionContext, TransactionEngine, TransactionResult, TransactionState,
};

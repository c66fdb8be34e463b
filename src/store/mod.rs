//! # Store Client Boundary
//!
//! The synchronous request/response interface this crate layers its pooling,
//! retry, failover and transaction policies over. Framing, TLS and the store's
//! own consistency guarantees belong to the implementation of [`StoreClient`].

pub mod memory;

pub use memory::InMemoryStore;

use crate::error::{ClientError, ClientResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Opaque version token returned by every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cas(pub u64);

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How many replicas or persistence acknowledgements a mutation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    #[default]
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Upsert,
    Insert,
    Replace,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreMode::Upsert => write!(f, "upsert"),
            StoreMode::Insert => write!(f, "insert"),
            StoreMode::Replace => write!(f, "replace"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOptions {
    pub cas: Option<Cas>,
    pub expiry: Option<Duration>,
    pub flags: u32,
    pub durability: DurabilityLevel,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoveOptions {
    pub cas: Option<Cas>,
    pub durability: DurabilityLevel,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterOptions {
    /// Value to create the counter with when the document does not exist.
    /// `None` makes a missing counter an error.
    pub initial: Option<u64>,
    pub expiry: Option<Duration>,
    pub durability: DurabilityLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Ad-hoc statements skip the prepared statement cache.
    pub adhoc: bool,
    pub parameters: Vec<Value>,
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            adhoc: true,
            parameters: Vec::new(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub value: Value,
    pub cas: Cas,
    /// Remaining lifetime of the document, when the store reports it.
    pub expiry: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: Cas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub value: u64,
    pub cas: Cas,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Value>,
}

/// Synchronous operations against a document store.
///
/// Implementations block the calling thread until the store answers.
pub trait StoreClient: Send + Sync {
    fn get(&self, key: &str) -> ClientResult<GetResult>;

    fn store(
        &self,
        key: &str,
        value: Value,
        mode: StoreMode,
        options: &StoreOptions,
    ) -> ClientResult<MutationResult>;

    fn remove(&self, key: &str, options: &RemoveOptions) -> ClientResult<MutationResult>;

    /// Adjust a counter document by `delta`. Decrements saturate at zero.
    fn counter(&self, key: &str, delta: i64, options: &CounterOptions) -> ClientResult<CounterResult>;

    fn touch(&self, key: &str, expiry: Option<Duration>) -> ClientResult<MutationResult>;

    fn unlock(&self, key: &str, cas: Cas) -> ClientResult<()>;

    fn query(&self, statement: &str, options: &QueryOptions) -> ClientResult<QueryResult>;

    /// Cheap liveness check used for connection validation and health probes.
    fn ping(&self) -> ClientResult<()> {
        Ok(())
    }

    /// Prepare `statement` and return the name the store assigned to the plan.
    fn prepare(&self, statement: &str) -> ClientResult<String> {
        let result = self.query(&format!("PREPARE {statement}"), &QueryOptions::default())?;
        result
            .rows
            .first()
            .and_then(|row| row.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::QueryFailed(format!("PREPARE returned no plan name for: {statement}")))
    }
}

impl<S: StoreClient + ?Sized> StoreClient for std::sync::Arc<S> {
    fn get(&self, key: &str) -> ClientResult<GetResult> {
        (**self).get(key)
    }

    fn store(
        &self,
        key: &str,
        value: Value,
        mode: StoreMode,
        options: &StoreOptions,
    ) -> ClientResult<MutationResult> {
        (**self).store(key, value, mode, options)
    }

    fn remove(&self, key: &str, options: &RemoveOptions) -> ClientResult<MutationResult> {
        (**self).remove(key, options)
    }

    fn counter(&self, key: &str, delta: i64, options: &CounterOptions) -> ClientResult<CounterResult> {
        (**self).counter(key, delta, options)
    }

    fn touch(&self, key: &str, expiry: Option<Duration>) -> ClientResult<MutationResult> {
        (**self).touch(key, expiry)
    }

    fn unlock(&self, key: &str, cas: Cas) -> ClientResult<()> {
        (**self).unlock(key, cas)
    }

    fn query(&self, statement: &str, options: &QueryOptions) -> ClientResult<QueryResult> {
        (**self).query(statement, options)
    }

    fn ping(&self) -> ClientResult<()> {
        (**self).ping()
    }

    fn prepare(&self, statement: &str) -> ClientResult<String> {
        (**self).prepare(statement)
    }
}

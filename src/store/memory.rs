//! In-process [`StoreClient`] with the same observable semantics as a cluster
//! node: CAS checks, expiry, pessimistic locks, counters and prepared queries.
//! Also supports fault injection so resilience layers can be exercised.

use super::{
    Cas, CounterOptions, CounterResult, GetResult, MutationResult, QueryOptions, QueryResult,
    RemoveOptions, StoreClient, StoreMode, StoreOptions,
};
use crate::error::{ClientError, ClientResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredDocument {
    value: Value,
    cas: Cas,
    expires_at: Option<Instant>,
    locked_until: Option<Instant>,
}

impl StoredDocument {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// A locked document only accepts mutations carrying the lock CAS.
    fn check_lock(&self, key: &str, cas: Option<Cas>, now: Instant) -> ClientResult<()> {
        if self.is_locked(now) && cas != Some(self.cas) {
            return Err(ClientError::DocumentLocked {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn check_cas(&self, key: &str, cas: Option<Cas>) -> ClientResult<()> {
        match cas {
            Some(expected) if expected != self.cas => Err(ClientError::CasMismatch {
                key: key.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct InMemoryStore {
    documents: DashMap<String, Option<StoredDocument>>,
    next_cas: AtomicU64,
    stubbed_queries: DashMap<String, Vec<Value>>,
    prepared: DashMap<String, String>,
    injected_failures: Mutex<VecDeque<ClientError>>,
    calls: Mutex<Vec<String>>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            next_cas: AtomicU64::new(0),
            stubbed_queries: DashMap::new(),
            prepared: DashMap::new(),
            injected_failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Make the next `count` operations fail with `error` before touching any data.
    pub fn fail_next(&self, count: usize, error: ClientError) {
        let mut failures = self.injected_failures.lock();
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// When unavailable, every operation (including `ping`) fails with a network error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Rows returned for `statement` (and for `EXECUTE` of a plan prepared from it).
    pub fn stub_query(&self, statement: impl Into<String>, rows: Vec<Value>) {
        self.stubbed_queries.insert(statement.into(), rows);
    }

    /// Operations seen so far, formatted as `"<op> <key>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }

    /// Number of live (non-expired) documents.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.documents
            .iter()
            .filter(|entry| entry.value().as_ref().is_some_and(|doc| !doc.is_expired(now)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch a document and hold a pessimistic lock on it for `lock_time`.
    /// The returned CAS is the only one that can mutate or unlock it.
    pub fn get_and_lock(&self, key: &str, lock_time: Duration) -> ClientResult<GetResult> {
        self.begin("get_and_lock", key)?;
        let cas = self.next_cas();
        self.mutate(key, |slot, now| {
            let doc = slot.as_mut().ok_or_else(|| not_found(key))?;
            if doc.is_locked(now) {
                return Err(ClientError::DocumentLocked {
                    key: key.to_string(),
                });
            }
            doc.cas = cas;
            doc.locked_until = Some(now + lock_time);
            Ok(GetResult {
                value: doc.value.clone(),
                cas,
                expiry: remaining(doc.expires_at, now),
            })
        })
    }

    fn next_cas(&self) -> Cas {
        Cas(self.next_cas.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Record the call and surface availability or injected failures.
    fn begin(&self, operation: &str, key: &str) -> ClientResult<()> {
        self.calls.lock().push(format!("{operation} {key}"));
        if !self.available.load(Ordering::Acquire) {
            return Err(ClientError::NetworkError("store unavailable".to_string()));
        }
        if let Some(error) = self.injected_failures.lock().pop_front() {
            debug!(operation = %operation, key = %key, error = %error, "Injected store failure");
            return Err(error);
        }
        Ok(())
    }

    /// Run `f` against the (possibly absent) document slot for `key` under the
    /// shard lock. Expired documents are presented as absent.
    fn mutate<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Option<StoredDocument>, Instant) -> ClientResult<R>,
    ) -> ClientResult<R> {
        let now = Instant::now();
        let (result, vacant) = {
            let mut entry = self.documents.entry(key.to_string()).or_insert(None);
            let slot: &mut Option<StoredDocument> = &mut entry;
            if slot.as_ref().is_some_and(|doc| doc.is_expired(now)) {
                *slot = None;
            }
            let result = f(slot, now);
            (result, slot.is_none())
        };
        if vacant {
            self.documents.remove_if(key, |_, doc| doc.is_none());
        }
        result
    }
}

fn not_found(key: &str) -> ClientError {
    ClientError::DocumentNotFound {
        key: key.to_string(),
    }
}

fn remaining(expires_at: Option<Instant>, now: Instant) -> Option<Duration> {
    expires_at.map(|at| at.saturating_duration_since(now))
}

fn counter_value(key: &str, value: &Value) -> ClientResult<u64> {
    value.as_u64().ok_or_else(|| {
        ClientError::InvalidArgument(format!("document {key} is not a counter"))
    })
}

impl StoreClient for InMemoryStore {
    fn get(&self, key: &str) -> ClientResult<GetResult> {
        self.begin("get", key)?;
        let now = Instant::now();
        let entry = self.documents.get(key).ok_or_else(|| not_found(key))?;
        match entry.value() {
            Some(doc) if !doc.is_expired(now) => Ok(GetResult {
                value: doc.value.clone(),
                cas: doc.cas,
                expiry: remaining(doc.expires_at, now),
            }),
            _ => Err(not_found(key)),
        }
    }

    fn store(
        &self,
        key: &str,
        value: Value,
        mode: StoreMode,
        options: &StoreOptions,
    ) -> ClientResult<MutationResult> {
        self.begin(&mode.to_string(), key)?;
        let cas = self.next_cas();
        self.mutate(key, |slot, now| {
            match (mode, slot.as_ref()) {
                (StoreMode::Insert, Some(_)) => {
                    return Err(ClientError::DocumentExists {
                        key: key.to_string(),
                    })
                }
                (StoreMode::Replace, None) => return Err(not_found(key)),
                (_, Some(existing)) => {
                    existing.check_lock(key, options.cas, now)?;
                    existing.check_cas(key, options.cas)?;
                }
                (_, None) => {}
            }
            *slot = Some(StoredDocument {
                value,
                cas,
                expires_at: options.expiry.map(|ttl| now + ttl),
                locked_until: None,
            });
            Ok(MutationResult { cas })
        })
    }

    fn remove(&self, key: &str, options: &RemoveOptions) -> ClientResult<MutationResult> {
        self.begin("remove", key)?;
        let cas = self.next_cas();
        self.mutate(key, |slot, now| {
            let existing = slot.as_ref().ok_or_else(|| not_found(key))?;
            existing.check_lock(key, options.cas, now)?;
            existing.check_cas(key, options.cas)?;
            *slot = None;
            Ok(MutationResult { cas })
        })
    }

    fn counter(&self, key: &str, delta: i64, options: &CounterOptions) -> ClientResult<CounterResult> {
        let operation = if delta >= 0 { "increment" } else { "decrement" };
        self.begin(operation, key)?;
        let cas = self.next_cas();
        self.mutate(key, |slot, now| match slot.as_mut() {
            Some(doc) => {
                doc.check_lock(key, None, now)?;
                let current = counter_value(key, &doc.value)?;
                let next = if delta >= 0 {
                    current.saturating_add(delta.unsigned_abs())
                } else {
                    current.saturating_sub(delta.unsigned_abs())
                };
                doc.value = json!(next);
                doc.cas = cas;
                Ok(CounterResult { value: next, cas })
            }
            None => {
                let initial = options.initial.ok_or_else(|| not_found(key))?;
                *slot = Some(StoredDocument {
                    value: json!(initial),
                    cas,
                    expires_at: options.expiry.map(|ttl| now + ttl),
                    locked_until: None,
                });
                Ok(CounterResult { value: initial, cas })
            }
        })
    }

    fn touch(&self, key: &str, expiry: Option<Duration>) -> ClientResult<MutationResult> {
        self.begin("touch", key)?;
        let cas = self.next_cas();
        self.mutate(key, |slot, now| {
            let doc = slot.as_mut().ok_or_else(|| not_found(key))?;
            doc.check_lock(key, None, now)?;
            doc.expires_at = expiry.map(|ttl| now + ttl);
            doc.cas = cas;
            Ok(MutationResult { cas })
        })
    }

    fn unlock(&self, key: &str, cas: Cas) -> ClientResult<()> {
        self.begin("unlock", key)?;
        self.mutate(key, |slot, now| {
            let doc = slot.as_mut().ok_or_else(|| not_found(key))?;
            if !doc.is_locked(now) {
                return Err(ClientError::InvalidArgument(format!(
                    "document {key} is not locked"
                )));
            }
            doc.check_cas(key, Some(cas))?;
            doc.locked_until = None;
            Ok(())
        })
    }

    fn query(&self, statement: &str, _options: &QueryOptions) -> ClientResult<QueryResult> {
        self.begin("query", statement)?;
        if let Some(body) = statement.strip_prefix("PREPARE ") {
            let name = Uuid::new_v4().to_string();
            self.prepared.insert(name.clone(), body.to_string());
            return Ok(QueryResult {
                rows: vec![json!({ "name": name })],
            });
        }
        let statement = match statement.strip_prefix("EXECUTE ") {
            Some(name) => self
                .prepared
                .get(name)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| ClientError::QueryFailed(format!("unknown prepared statement {name}")))?,
            None => statement.to_string(),
        };
        let rows = self
            .stubbed_queries
            .get(&statement)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        Ok(QueryResult { rows })
    }

    fn ping(&self) -> ClientResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ClientError::NetworkError("store unavailable".to_string()))
        }
    }
}

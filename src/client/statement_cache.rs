//! Prepared statement cache owned by a [`Client`](super::Client).
//!
//! Maps statement text to the plan name the store assigned when the statement
//! was prepared. Entries expire after `ttl` and the least recently used entry
//! is dropped once `max_entries` is reached.

use crate::config::{ConfigResult, ConfigurationError};
use crate::error::ClientResult;
use crate::utils::serde::optional_duration_ms;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    pub max_entries: usize,

    /// Plans older than this are prepared again. `None` keeps them until evicted.
    #[serde(rename = "ttl_ms", with = "optional_duration_ms")]
    pub ttl: Option<Duration>,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            ttl: Some(Duration::from_secs(600)),
        }
    }
}

impl QueryCacheConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_entries == 0 {
            return Err(ConfigurationError::invalid_value(
                "query_cache.max_entries",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CachedStatement {
    name: String,
    prepared_at: Instant,
    last_used: Instant,
}

impl CachedStatement {
    fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.duration_since(self.prepared_at) >= ttl)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatementCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct StatementCache {
    config: QueryCacheConfig,
    entries: DashMap<String, CachedStatement>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl StatementCache {
    pub fn new(config: QueryCacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Plan name for `statement`, if cached and not expired
    pub fn get(&self, statement: &str) -> Option<String> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        if self
            .entries
            .remove_if(statement, |_, cached| cached.is_expired(ttl, now))
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut cached = self.entries.get_mut(statement)?;
        cached.last_used = now;
        Some(cached.name.clone())
    }

    /// Cached plan name, or the result of `prepare` which is then cached.
    /// A failed prepare caches nothing.
    pub fn get_or_prepare<P>(&self, statement: &str, prepare: P) -> ClientResult<String>
    where
        P: FnOnce(&str) -> ClientResult<String>,
    {
        if let Some(name) = self.get(statement) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(name);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let name = prepare(statement)?;
        self.insert(statement, name.clone());
        Ok(name)
    }

    pub fn insert(&self, statement: impl Into<String>, name: impl Into<String>) {
        let statement = statement.into();
        if !self.entries.contains_key(&statement) {
            while self.entries.len() >= self.config.max_entries {
                if !self.evict_least_recently_used() {
                    break;
                }
            }
        }
        let now = Instant::now();
        self.entries.insert(
            statement,
            CachedStatement {
                name: name.into(),
                prepared_at: now,
                last_used: now,
            },
        );
    }

    fn evict_least_recently_used(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_used)
            .map(|entry| entry.key().clone());
        match oldest {
            Some(statement) => {
                debug!(statement = %statement, "Evicting least recently used prepared statement");
                self.evict(&statement)
            }
            None => false,
        }
    }

    /// Drop the plan for `statement`. Returns whether one was cached.
    pub fn evict(&self, statement: &str) -> bool {
        let removed = self.entries.remove(statement).is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every plan older than `ttl`. Returns how many were dropped.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, cached| !cached.is_expired(ttl, now));
        let expired = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> StatementCacheStats {
        StatementCacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::thread;

    fn cache(max_entries: usize, ttl: Option<Duration>) -> StatementCache {
        StatementCache::new(QueryCacheConfig { max_entries, ttl })
    }

    #[test]
    fn test_prepares_once() {
        let cache = cache(4, None);
        let mut prepared = 0;
        for _ in 0..3 {
            let name = cache
                .get_or_prepare("SELECT 1", |_| {
                    prepared += 1;
                    Ok("p1".to_string())
                })
                .unwrap();
            assert_eq!(name, "p1");
        }
        assert_eq!(prepared, 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[test]
    fn test_failed_prepare_is_not_cached() {
        let cache = cache(4, None);
        let result = cache.get_or_prepare("BROKEN", |_| Err(ClientError::QueryFailed("syntax".into())));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = cache(2, None);
        cache.insert("a", "pa");
        thread::sleep(Duration::from_millis(2));
        cache.insert("b", "pb");
        thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("a").as_deref(), Some("pa"));
        thread::sleep(Duration::from_millis(2));

        cache.insert("c", "pc");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache(8, Some(Duration::from_millis(10)));
        cache.insert("a", "pa");
        cache.insert("b", "pb");
        thread::sleep(Duration::from_millis(20));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.expire(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_and_clear() {
        let cache = cache(8, None);
        cache.insert("a", "pa");
        assert!(cache.evict("a"));
        assert!(!cache.evict("a"));
        cache.insert("b", "pb");
        cache.clear();
        assert!(cache.is_empty());
    }
}

//! # Connection Pool
//!
//! A bounded set of store connections lent to one caller at a time.
//!
//! All pool state sits behind a single mutex: borrow, return and eviction are
//! serialized, and connections are created while the lock is held. A caller
//! that finds the pool at capacity waits on a condition variable for up to
//! `acquisition_timeout` before failing with `ConnectionPoolExhausted`.
//!
//! Borrowed connections come back through the [`PooledConnection`] guard when
//! it is dropped.

mod config;
mod connection;
mod maintenance;

pub use config::ConnectionPoolConfig;
pub use connection::{Connection, ConnectionFactory};

use crate::error::{ClientError, ClientResult};
use crate::logging::log_pool_operation;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_created: u64,
    pub total_reused: u64,
    pub total_evicted: u64,
    pub validation_failures: u64,
    /// Connections currently borrowed
    pub active: usize,
    /// Connections waiting in the pool
    pub idle: usize,
    /// Connections in existence
    pub size: usize,
}

struct PoolState<H> {
    available: VecDeque<Connection<H>>,
    members: HashSet<Uuid>,
    /// Bumped by `clear`; connections from an older generation are not recycled
    generation: u64,
    total_created: u64,
    total_reused: u64,
    total_evicted: u64,
    validation_failures: u64,
}

pub(crate) struct Shared<F: ConnectionFactory> {
    factory: F,
    config: ConnectionPoolConfig,
    state: Mutex<PoolState<F::Handle>>,
    returned: Condvar,
}

impl<F: ConnectionFactory> Shared<F> {
    fn create_locked(&self, state: &mut PoolState<F::Handle>) -> ClientResult<Connection<F::Handle>> {
        let handle = self.factory.connect()?;
        let conn = Connection::new(handle, state.generation);
        state.members.insert(conn.id());
        state.total_created += 1;
        log_pool_operation(
            "create",
            Some(&conn.id().to_string()),
            state.members.len() - state.available.len(),
            state.available.len(),
            None,
        );
        Ok(conn)
    }

    fn evict_locked(&self, state: &mut PoolState<F::Handle>, conn: Connection<F::Handle>, reason: &str) {
        let id = conn.id();
        state.members.remove(&id);
        state.total_evicted += 1;
        self.factory.destroy(conn.into_handle());
        log_pool_operation(
            "evict",
            Some(&id.to_string()),
            state.members.len() - state.available.len(),
            state.available.len(),
            Some(reason),
        );
        // Capacity freed, a waiter may create a replacement
        self.returned.notify_one();
    }

    fn release(&self, mut conn: Connection<F::Handle>) {
        let mut state = self.state.lock();
        if !state.members.contains(&conn.id()) {
            self.factory.destroy(conn.into_handle());
            return;
        }
        if conn.generation != state.generation {
            self.evict_locked(&mut state, conn, "stale generation");
            return;
        }
        if conn.is_valid() && self.config.validate_on_return {
            let valid = self.factory.validate(conn.handle());
            conn.mark_validated(valid);
            if !valid {
                state.validation_failures += 1;
            }
        }
        if !conn.is_valid() {
            self.evict_locked(&mut state, conn, "invalid on return");
            return;
        }
        if conn.is_expired(self.config.connection_ttl) {
            self.evict_locked(&mut state, conn, "ttl expired");
            return;
        }

        conn.mark_used();
        state.available.push_back(conn);
        drop(state);
        self.returned.notify_one();
    }
}

/// Bounded pool of connections produced by a [`ConnectionFactory`]
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: ConnectionPoolConfig) -> ClientResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                state: Mutex::new(PoolState {
                    available: VecDeque::with_capacity(config.max_connections),
                    members: HashSet::with_capacity(config.max_connections),
                    generation: 0,
                    total_created: 0,
                    total_reused: 0,
                    total_evicted: 0,
                    validation_failures: 0,
                }),
                config,
                returned: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Pre-create connections up to `min_connections`. Returns how many were created.
    pub fn initialize(&self) -> ClientResult<usize> {
        let mut state = self.shared.state.lock();
        let mut created = 0;
        while state.members.len() < self.shared.config.min_connections {
            let conn = self.shared.create_locked(&mut state)?;
            state.available.push_back(conn);
            created += 1;
        }
        drop(state);
        self.shared.returned.notify_all();
        Ok(created)
    }

    /// Borrow a connection, creating one when none is idle and the pool is
    /// below `max_connections`.
    pub fn borrow(&self) -> ClientResult<PooledConnection<F>> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.acquisition_timeout;
        let mut state = shared.state.lock();

        loop {
            if let Some(conn) = self.take_available(&mut state) {
                state.total_reused += 1;
                debug!(connection_id = %conn.id(), use_count = conn.use_count(), "Reusing connection");
                return Ok(self.lend(conn));
            }

            if state.members.len() < shared.config.max_connections {
                let conn = shared.create_locked(&mut state)?;
                return Ok(self.lend(conn));
            }

            if Instant::now() >= deadline {
                warn!(
                    max_connections = shared.config.max_connections,
                    "Connection pool exhausted"
                );
                return Err(ClientError::ConnectionPoolExhausted {
                    max_connections: shared.config.max_connections,
                });
            }
            shared.returned.wait_until(&mut state, deadline);
        }
    }

    /// Pop the most recently returned connection that passes borrow checks.
    /// Connections that fail are evicted.
    fn take_available(&self, state: &mut MutexGuard<'_, PoolState<F::Handle>>) -> Option<Connection<F::Handle>> {
        let shared = &self.shared;
        while let Some(mut conn) = state.available.pop_back() {
            if conn.is_expired(shared.config.connection_ttl) {
                shared.evict_locked(state, conn, "ttl expired");
                continue;
            }
            if shared.config.validate_on_borrow {
                let valid = shared.factory.validate(conn.handle());
                conn.mark_validated(valid);
                if !valid {
                    state.validation_failures += 1;
                    shared.evict_locked(state, conn, "validation failed on borrow");
                    continue;
                }
            }
            return Some(conn);
        }
        None
    }

    fn lend(&self, conn: Connection<F::Handle>) -> PooledConnection<F> {
        PooledConnection {
            shared: Arc::clone(&self.shared),
            conn: Some(conn),
        }
    }

    /// Explicit form of dropping the guard
    pub fn return_connection(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    /// Destroy a borrowed connection instead of recycling it
    pub fn evict(&self, mut conn: PooledConnection<F>) {
        if let Some(inner) = conn.conn.take() {
            let mut state = self.shared.state.lock();
            if state.members.contains(&inner.id()) {
                self.shared.evict_locked(&mut state, inner, "evicted by caller");
            } else {
                self.shared.factory.destroy(inner.into_handle());
            }
        }
    }

    /// Evict every idle connection. Borrowed connections are evicted when
    /// they come back rather than recycled.
    pub fn clear(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        let idle: Vec<_> = state.available.drain(..).collect();
        let evicted = idle.len();
        for conn in idle {
            self.shared.evict_locked(&mut state, conn, "pool cleared");
        }
        drop(state);
        self.shared.returned.notify_all();
        evicted
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total_created: state.total_created,
            total_reused: state.total_reused,
            total_evicted: state.total_evicted,
            validation_failures: state.validation_failures,
            active: state.members.len() - state.available.len(),
            idle: state.available.len(),
            size: state.members.len(),
        }
    }
}

/// A borrowed connection. Returns itself to the pool when dropped.
pub struct PooledConnection<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    conn: Option<Connection<F::Handle>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn id(&self) -> Uuid {
        self.connection().id()
    }

    pub fn use_count(&self) -> u64 {
        self.connection().use_count()
    }

    /// Destroy the connection when it is returned instead of recycling it
    pub fn invalidate(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.invalidate();
        }
    }

    fn connection(&self) -> &Connection<F::Handle> {
        // Only `Drop` and `ConnectionPool::evict` take the connection out
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Handle;

    fn deref(&self) -> &F::Handle {
        self.connection().handle()
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Handle {
        match self.conn.as_mut() {
            Some(conn) => conn.handle_mut(),
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn);
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").field("conn", &self.conn).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingFactory {
        next: AtomicUsize,
        live: AtomicUsize,
        peak: AtomicUsize,
        healthy: AtomicBool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                healthy: AtomicBool::new(true),
                ..Default::default()
            }
        }
    }

    impl ConnectionFactory for Arc<CountingFactory> {
        type Handle = usize;

        fn connect(&self) -> ClientResult<usize> {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn validate(&self, _handle: &usize) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn destroy(&self, _handle: usize) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn pool(max: usize, config: ConnectionPoolConfig) -> (ConnectionPool<Arc<CountingFactory>>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::new());
        let pool = ConnectionPool::new(
            Arc::clone(&factory),
            ConnectionPoolConfig {
                max_connections: max,
                min_connections: 0,
                ..config
            },
        )
        .unwrap();
        (pool, factory)
    }

    #[test]
    fn test_borrow_reuses_returned_connection() {
        let (pool, _) = pool(2, ConnectionPoolConfig::default());
        let first = pool.borrow().unwrap();
        let id = first.id();
        pool.return_connection(first);

        let again = pool.borrow().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.use_count(), 1);
        let stats = pool.stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_reused, 1);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn test_exhausted_at_capacity() {
        let (pool, _) = pool(
            2,
            ConnectionPoolConfig {
                acquisition_timeout: Duration::ZERO,
                ..Default::default()
            },
        );
        let _a = pool.borrow().unwrap();
        let _b = pool.borrow().unwrap();
        assert!(matches!(
            pool.borrow(),
            Err(ClientError::ConnectionPoolExhausted { max_connections: 2 })
        ));
    }

    #[test]
    fn test_waits_for_returned_connection() {
        let (pool, _) = pool(
            1,
            ConnectionPoolConfig {
                acquisition_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        );
        let held = pool.borrow().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow().map(|conn| conn.id()))
        };
        thread::sleep(Duration::from_millis(50));
        let id = held.id();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn test_invalid_connection_is_evicted_on_borrow() {
        let (pool, factory) = pool(1, ConnectionPoolConfig::default());
        let conn = pool.borrow().unwrap();
        let first = conn.id();
        drop(conn);

        factory.healthy.store(false, Ordering::SeqCst);
        let replacement = pool.borrow().unwrap();
        assert_ne!(replacement.id(), first);
        let stats = pool.stats();
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(stats.total_evicted, 1);
        assert_eq!(factory.live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_validate_on_return_and_invalidate() {
        let (pool, factory) = pool(
            2,
            ConnectionPoolConfig {
                validate_on_return: true,
                ..Default::default()
            },
        );

        let mut conn = pool.borrow().unwrap();
        conn.invalidate();
        drop(conn);
        assert_eq!(pool.stats().size, 0);

        let conn = pool.borrow().unwrap();
        factory.healthy.store(false, Ordering::SeqCst);
        drop(conn);
        let stats = pool.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_evict() {
        let (pool, factory) = pool(1, ConnectionPoolConfig::default());
        let conn = pool.borrow().unwrap();
        pool.evict(conn);
        assert_eq!(pool.stats().size, 0);
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_retires_borrowed_connections() {
        let (pool, factory) = pool(3, ConnectionPoolConfig::default());
        let held = pool.borrow().unwrap();
        drop(pool.borrow().unwrap());
        assert_eq!(pool.stats().idle, 1);

        assert_eq!(pool.clear(), 1);
        drop(held);
        assert_eq!(pool.stats().size, 0);
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_initialize_prefills_minimum() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ConnectionPool::new(
            Arc::clone(&factory),
            ConnectionPoolConfig {
                max_connections: 4,
                min_connections: 3,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(pool.initialize().unwrap(), 3);
        assert_eq!(pool.initialize().unwrap(), 0);
        assert_eq!(pool.stats().idle, 3);
    }

    #[test]
    fn test_concurrent_borrows_respect_capacity() {
        let (pool, factory) = pool(
            4,
            ConnectionPoolConfig {
                validate_on_borrow: false,
                ..Default::default()
            },
        );
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let conn = pool.borrow().unwrap();
                        thread::sleep(Duration::from_micros(200));
                        drop(conn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(factory.peak.load(Ordering::SeqCst) <= 4);
        assert!(pool.stats().size <= 4);
    }
}

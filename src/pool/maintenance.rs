//! Background eviction sweep for idle pool connections.
//!
//! One sweep evicts idle connections that outlived `connection_ttl`, idled past
//! `idle_timeout` while the pool is above `min_connections`, or failed an idle
//! validation (`validate_while_idle`, at most once per `validation_interval`).
//! The pool is then topped back up to `min_connections`.

use super::{ConnectionFactory, ConnectionPool, Shared};
use crate::error::ClientResult;
use crate::utils::PeriodicTask;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

impl<F: ConnectionFactory> Shared<F> {
    fn evict_idle(&self) -> usize {
        let config = &self.config;
        let mut state = self.state.lock();
        let idle: Vec<_> = state.available.drain(..).collect();
        let mut evicted = 0;

        for mut conn in idle {
            if conn.is_expired(config.connection_ttl) {
                self.evict_locked(&mut state, conn, "ttl expired");
                evicted += 1;
                continue;
            }
            if conn.idle_time() >= config.idle_timeout && state.members.len() > config.min_connections {
                self.evict_locked(&mut state, conn, "idle timeout");
                evicted += 1;
                continue;
            }
            if config.validate_while_idle && conn.needs_validation(config.validation_interval) {
                let valid = self.factory.validate(conn.handle());
                conn.mark_validated(valid);
                if !valid {
                    state.validation_failures += 1;
                    self.evict_locked(&mut state, conn, "idle validation failed");
                    evicted += 1;
                    continue;
                }
            }
            state.available.push_back(conn);
        }

        while state.members.len() < config.min_connections {
            match self.create_locked(&mut state) {
                Ok(conn) => state.available.push_back(conn),
                Err(error) => {
                    warn!(error = %error, "Failed to replenish pool to min_connections");
                    break;
                }
            }
        }
        drop(state);
        self.returned.notify_all();

        if evicted > 0 {
            debug!(evicted = evicted, "Idle eviction sweep completed");
        }
        evicted
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Run one eviction sweep now. Returns how many connections were evicted.
    pub fn evict_idle(&self) -> usize {
        self.shared.evict_idle()
    }

    /// Sweep every `eviction_interval` on a background thread until the
    /// returned handle or the pool is dropped. `None` when eviction is disabled.
    pub fn start_maintenance(&self) -> ClientResult<Option<PeriodicTask>> {
        if !self.shared.config.eviction_enabled {
            return Ok(None);
        }
        let shared: Weak<Shared<F>> = Arc::downgrade(&self.shared);
        let task = PeriodicTask::spawn(
            "docstore-pool-maintenance",
            self.shared.config.eviction_interval,
            move || match shared.upgrade() {
                Some(shared) => {
                    shared.evict_idle();
                    true
                }
                None => false,
            },
        )?;
        Ok(Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::super::ConnectionPoolConfig;
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct Factory {
        live: AtomicUsize,
        healthy: AtomicBool,
    }

    impl ConnectionFactory for Arc<Factory> {
        type Handle = ();

        fn connect(&self) -> ClientResult<()> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn validate(&self, _handle: &()) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn destroy(&self, _handle: ()) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn pool(config: ConnectionPoolConfig) -> (ConnectionPool<Arc<Factory>>, Arc<Factory>) {
        let factory = Arc::new(Factory {
            live: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        });
        (ConnectionPool::new(Arc::clone(&factory), config).unwrap(), factory)
    }

    fn hold_and_return(pool: &ConnectionPool<Arc<Factory>>, count: usize) {
        let held: Vec<_> = (0..count).map(|_| pool.borrow().unwrap()).collect();
        drop(held);
    }

    #[test]
    fn test_idle_timeout_keeps_minimum() {
        let (pool, factory) = pool(ConnectionPoolConfig {
            max_connections: 5,
            min_connections: 2,
            idle_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        hold_and_return(&pool, 5);
        thread::sleep(Duration::from_millis(20));

        assert_eq!(pool.evict_idle(), 3);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(factory.live.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ttl_evicts_and_replenishes() {
        let (pool, factory) = pool(ConnectionPoolConfig {
            max_connections: 3,
            min_connections: 1,
            connection_ttl: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        pool.initialize().unwrap();
        thread::sleep(Duration::from_millis(20));

        assert_eq!(pool.evict_idle(), 1);
        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.total_created, 2);
        assert_eq!(factory.live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_validation_failure_evicts() {
        let (pool, factory) = pool(ConnectionPoolConfig {
            max_connections: 2,
            min_connections: 0,
            validate_while_idle: true,
            validation_interval: Duration::ZERO,
            ..Default::default()
        });
        hold_and_return(&pool, 2);
        factory.healthy.store(false, Ordering::SeqCst);

        assert_eq!(pool.evict_idle(), 2);
        assert_eq!(pool.stats().validation_failures, 2);
    }

    #[test]
    fn test_background_sweep() {
        let (pool, factory) = pool(ConnectionPoolConfig {
            max_connections: 4,
            min_connections: 0,
            idle_timeout: Duration::from_millis(5),
            eviction_interval: Duration::from_millis(5),
            ..Default::default()
        });
        hold_and_return(&pool, 3);

        let task = pool.start_maintenance().unwrap().expect("eviction enabled");
        thread::sleep(Duration::from_millis(80));
        task.stop();
        assert_eq!(pool.stats().size, 0);
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disabled_eviction_starts_nothing() {
        let (pool, _) = pool(ConnectionPoolConfig {
            eviction_enabled: false,
            ..Default::default()
        });
        assert!(pool.start_maintenance().unwrap().is_none());
    }
}

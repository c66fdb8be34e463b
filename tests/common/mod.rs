//! Shared fixtures for integration tests

#![allow(dead_code)]

pub mod strategies;

use docstore_client::client::EndpointConnector;
use docstore_client::pool::ConnectionFactory;
use docstore_client::resilience::{Endpoint, FailoverConfig, RetryPolicy};
use docstore_client::store::InMemoryStore;
use docstore_client::{ClientConfig, ClientError, ClientResult, ConnectionPoolConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A set of in-memory nodes addressed by endpoint, one store per node.
/// Nodes can be made to refuse new connections.
#[derive(Default)]
pub struct Cluster {
    nodes: HashMap<String, Arc<InMemoryStore>>,
    refusing: Mutex<Vec<String>>,
    connects: Mutex<Vec<String>>,
}

impl Cluster {
    pub fn new(addresses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            nodes: addresses
                .iter()
                .map(|address| (address.to_string(), Arc::new(InMemoryStore::new())))
                .collect(),
            ..Default::default()
        })
    }

    pub fn node(&self, address: &str) -> &Arc<InMemoryStore> {
        &self.nodes[address]
    }

    /// Take a node down: requests fail with a network error and new
    /// connections are refused
    pub fn take_down(&self, address: &str) {
        self.node(address).set_available(false);
        self.refusing.lock().push(address.to_string());
    }

    pub fn bring_up(&self, address: &str) {
        self.node(address).set_available(true);
        self.refusing.lock().retain(|a| a != address);
    }

    /// Addresses connected to, in order
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

/// Connector handed to `Client::new`; shares the cluster with the test
#[derive(Clone)]
pub struct ClusterConnector(pub Arc<Cluster>);

impl EndpointConnector for ClusterConnector {
    type Store = Arc<InMemoryStore>;

    fn connect(&self, endpoint: &Endpoint) -> ClientResult<Self::Store> {
        let cluster = &self.0;
        cluster.connects.lock().push(endpoint.address.clone());
        if cluster.refusing.lock().contains(&endpoint.address) {
            return Err(ClientError::ConnectionFailed(format!(
                "connection refused by {}",
                endpoint.address
            )));
        }
        cluster
            .nodes
            .get(&endpoint.address)
            .cloned()
            .ok_or_else(|| ClientError::ConnectionFailed(format!("unknown endpoint {}", endpoint.address)))
    }
}

/// Retry policy that keeps integration tests fast
pub fn fast_retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.0,
        ..Default::default()
    }
}

pub fn client_config(addresses: &[&str]) -> ClientConfig {
    ClientConfig {
        endpoints: addresses.iter().map(|address| Endpoint::new(*address)).collect(),
        pool: ConnectionPoolConfig {
            max_connections: 4,
            min_connections: 0,
            acquisition_timeout: Duration::from_millis(200),
            eviction_enabled: false,
            ..Default::default()
        },
        retry: fast_retry_policy(4),
        failover: FailoverConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            recovery_timeout: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Handle produced by [`TrackingFactory`]
#[derive(Debug)]
pub struct TrackedHandle {
    pub serial: usize,
    pub healthy: Arc<AtomicBool>,
}

/// Pool factory counting live handles and the peak number alive at once
#[derive(Debug, Default)]
pub struct TrackingFactory {
    created: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
    destroyed: AtomicUsize,
    refuse: AtomicBool,
    handles: Mutex<Vec<Arc<AtomicBool>>>,
}

impl TrackingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Mark every handle created so far as broken
    pub fn break_all(&self) {
        for healthy in self.handles.lock().iter() {
            healthy.store(false, Ordering::SeqCst);
        }
    }
}

/// Shared handle to a [`TrackingFactory`] that the pool can own
#[derive(Debug, Clone)]
pub struct SharedFactory(pub Arc<TrackingFactory>);

impl std::ops::Deref for SharedFactory {
    type Target = TrackingFactory;

    fn deref(&self) -> &TrackingFactory {
        &self.0
    }
}

impl ConnectionFactory for SharedFactory {
    type Handle = TrackedHandle;

    fn connect(&self) -> ClientResult<TrackedHandle> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionFailed("refused".to_string()));
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        let healthy = Arc::new(AtomicBool::new(true));
        self.handles.lock().push(Arc::clone(&healthy));
        Ok(TrackedHandle { serial, healthy })
    }

    fn validate(&self, handle: &TrackedHandle) -> bool {
        handle.healthy.load(Ordering::SeqCst)
    }

    fn destroy(&self, handle: TrackedHandle) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        drop(handle);
    }
}

pub fn pool_config(max_connections: usize) -> ConnectionPoolConfig {
    ConnectionPoolConfig {
        max_connections,
        min_connections: 0,
        acquisition_timeout: Duration::ZERO,
        eviction_enabled: false,
        ..Default::default()
    }
}

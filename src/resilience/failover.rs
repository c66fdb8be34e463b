//! # Failover Manager
//!
//! Tracks the health of a logical cluster (a set of candidate endpoints) with a
//! single circuit breaker and rotates the active endpoint on failure.
//!
//! Failures reported through [`FailoverManager::handle_failure`] feed the
//! breaker. Once `failure_threshold` failures accumulate the breaker opens and
//! every further failure or failover attempt fails fast until
//! `recovery_timeout` elapses. While the breaker is not open, each failure
//! rotates `current_endpoint` to the next candidate picked by the configured
//! [`LoadBalancingStrategy`].

use crate::config::{ConfigResult, ConfigurationError};
use crate::error::{ClientError, ClientResult};
use crate::logging::log_failover_event;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::utils::serde::duration_ms;
use crate::utils::PeriodicTask;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BREAKER_NAME: &str = "failover";

fn default_weight() -> u32 {
    1
}

/// A candidate cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,

    /// Relative share of traffic under `weighted_round_robin`
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// When false failures are still recorded but the endpoint never rotates
    pub enabled: bool,

    /// Attempts made by [`FailoverManager::execute`], including the first
    pub max_attempts: u32,

    /// Wall-clock budget for [`FailoverManager::execute`]
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    pub backoff_multiplier: f64,

    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,

    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,

    pub circuit_breaker_enabled: bool,

    pub failure_threshold: u32,

    #[serde(rename = "recovery_timeout_ms", with = "duration_ms")]
    pub recovery_timeout: Duration,

    pub health_check_enabled: bool,

    #[serde(rename = "health_check_interval_ms", with = "duration_ms")]
    pub health_check_interval: Duration,

    pub load_balancing_strategy: LoadBalancingStrategy,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            circuit_breaker_enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            health_check_enabled: false,
            health_check_interval: Duration::from_secs(10),
            load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
        }
    }
}

impl FailoverConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "failover.failure_threshold",
                "must be greater than 0",
            ));
        }
        if self.circuit_breaker_enabled && self.recovery_timeout.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "failover.recovery_timeout_ms",
                "must be greater than 0 when the circuit breaker is enabled",
            ));
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(ConfigurationError::invalid_value(
                "failover.backoff_multiplier",
                "must be a finite value >= 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigurationError::invalid_value(
                "failover.initial_delay_ms",
                "must not exceed max_delay_ms",
            ));
        }
        if self.health_check_enabled && self.health_check_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "failover.health_check_interval_ms",
                "must be greater than 0 when health checks are enabled",
            ));
        }
        Ok(())
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            success_threshold: 1,
            failure_window: None,
        }
    }
}

/// Decides whether an endpoint is fit to receive traffic
pub trait HealthProbe: Send + Sync {
    fn probe(&self, endpoint: &Endpoint) -> bool;
}

impl<F> HealthProbe for F
where
    F: Fn(&Endpoint) -> bool + Send + Sync,
{
    fn probe(&self, endpoint: &Endpoint) -> bool {
        self(endpoint)
    }
}

#[derive(Debug)]
struct EndpointState {
    endpoint: Endpoint,
    healthy: AtomicBool,
    active_operations: AtomicUsize,
}

#[derive(Debug)]
struct Selection {
    current: usize,
    /// Running weights for smooth weighted round robin
    weights: Vec<i64>,
}

/// Snapshot of failover activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverStats {
    pub current_endpoint: String,
    pub circuit_state: CircuitState,
    pub failovers: u64,
    pub failures: u64,
    pub short_circuited: u64,
    pub healthy_endpoints: usize,
}

/// Marks an operation in flight against one endpoint. Used by the
/// `least_connections` strategy.
pub struct ActiveOperation<'a> {
    state: &'a EndpointState,
}

impl ActiveOperation<'_> {
    pub fn endpoint(&self) -> &Endpoint {
        &self.state.endpoint
    }
}

impl Drop for ActiveOperation<'_> {
    fn drop(&mut self) {
        self.state.active_operations.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct FailoverManager {
    config: FailoverConfig,
    endpoints: Vec<EndpointState>,
    breaker: Option<CircuitBreaker>,
    selection: RwLock<Selection>,
    probe: Option<Arc<dyn HealthProbe>>,
    last_health_check: Mutex<Option<Instant>>,
    failovers: AtomicU64,
    failures: AtomicU64,
    short_circuited: AtomicU64,
}

impl fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverManager")
            .field("config", &self.config)
            .field("current_endpoint", &self.get_current_endpoint())
            .field("circuit_state", &self.circuit_state())
            .finish()
    }
}

impl FailoverManager {
    pub fn new(config: FailoverConfig, endpoints: Vec<Endpoint>) -> ClientResult<Self> {
        config.validate()?;
        if endpoints.is_empty() {
            return Err(ClientError::Configuration(
                "failover requires at least one endpoint".to_string(),
            ));
        }

        let breaker = config
            .circuit_breaker_enabled
            .then(|| CircuitBreaker::new(BREAKER_NAME, config.circuit_breaker_config()));

        info!(
            endpoints = endpoints.len(),
            strategy = ?config.load_balancing_strategy,
            enabled = config.enabled,
            "🔀 Failover manager initialized"
        );

        Ok(Self {
            selection: RwLock::new(Selection {
                current: 0,
                weights: vec![0; endpoints.len()],
            }),
            endpoints: endpoints
                .into_iter()
                .map(|endpoint| EndpointState {
                    endpoint,
                    healthy: AtomicBool::new(true),
                    active_operations: AtomicUsize::new(0),
                })
                .collect(),
            config,
            breaker,
            probe: None,
            last_health_check: Mutex::new(None),
            failovers: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        })
    }

    pub fn with_health_probe(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(|s| s.endpoint.clone()).collect()
    }

    /// Endpoint currently receiving traffic. Safe to call during a failover.
    pub fn get_current_endpoint(&self) -> Endpoint {
        let selection = self.selection.read();
        self.endpoints[selection.current].endpoint.clone()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker
            .as_ref()
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Whether the breaker lets a call through. Moves an expired open breaker
    /// to half-open.
    pub fn allow_request(&self) -> bool {
        self.breaker.as_ref().map_or(true, CircuitBreaker::allow_request)
    }

    /// [`allow_request`](Self::allow_request) as a `Result`
    pub fn ensure_available(&self) -> ClientResult<()> {
        if self.allow_request() {
            Ok(())
        } else {
            Err(self.short_circuit("request"))
        }
    }

    /// Hand back an admission that never reached the endpoint, such as a
    /// call that could not get a connection for reasons unrelated to it
    pub fn release_request(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.release_probe();
        }
    }

    /// Record an endpoint failure. Returns the endpoint to use next, or
    /// `CircuitBreakerOpen` when the breaker is (or just became) open.
    pub fn handle_failure(&self) -> ClientResult<Endpoint> {
        self.failures.fetch_add(1, Ordering::Relaxed);

        if let Some(breaker) = &self.breaker {
            if breaker.state() == CircuitState::Open && !breaker.allow_request() {
                return Err(self.short_circuit("handle_failure"));
            }
            if breaker.record_failure() == CircuitState::Open {
                let current = self.get_current_endpoint();
                log_failover_event(
                    "circuit_opened",
                    Some(&current.address),
                    None,
                    Some("failure threshold reached"),
                );
                return Err(ClientError::CircuitBreakerOpen {
                    component: BREAKER_NAME.to_string(),
                });
            }
        }

        if !self.config.enabled {
            debug!("Failover disabled, keeping current endpoint");
            return Ok(self.get_current_endpoint());
        }
        self.perform_failover()
    }

    /// Rotate to the next candidate endpoint. A single-endpoint cluster keeps
    /// its endpoint; a cluster with no healthy candidate fails with
    /// `FailoverExhausted`.
    pub fn perform_failover(&self) -> ClientResult<Endpoint> {
        if self.circuit_state() == CircuitState::Open {
            return Err(self.short_circuit("perform_failover"));
        }
        if self.config.health_check_enabled {
            self.run_health_checks();
        }

        let mut selection = self.selection.write();
        let current = selection.current;
        if self.endpoints.len() == 1 {
            return Ok(self.endpoints[current].endpoint.clone());
        }

        let candidates: Vec<usize> = (0..self.endpoints.len())
            .filter(|&i| i != current && self.endpoints[i].healthy.load(Ordering::Acquire))
            .collect();
        if candidates.is_empty() {
            log_failover_event(
                "failover_exhausted",
                Some(&self.endpoints[current].endpoint.address),
                None,
                Some("no healthy candidate endpoints"),
            );
            return Err(ClientError::FailoverExhausted {
                attempts: (self.endpoints.len() - 1) as u32,
            });
        }

        let next = self.select(&mut selection, &candidates);
        selection.current = next;
        drop(selection);

        self.failovers.fetch_add(1, Ordering::Relaxed);
        let from = &self.endpoints[current].endpoint;
        let to = &self.endpoints[next].endpoint;
        log_failover_event("failover", Some(&from.address), Some(&to.address), None);
        Ok(to.clone())
    }

    fn select(&self, selection: &mut Selection, candidates: &[usize]) -> usize {
        let len = self.endpoints.len();
        let current = selection.current;
        // Position after `current` in cyclic order
        let distance = |i: usize| (i + len - current) % len;

        match self.config.load_balancing_strategy {
            LoadBalancingStrategy::RoundRobin => candidates
                .iter()
                .copied()
                .min_by_key(|&i| distance(i))
                .unwrap_or(current),
            LoadBalancingStrategy::LeastConnections => candidates
                .iter()
                .copied()
                .min_by_key(|&i| (self.endpoints[i].active_operations.load(Ordering::Acquire), i))
                .unwrap_or(current),
            LoadBalancingStrategy::WeightedRoundRobin => {
                let mut total = 0i64;
                let mut best: Option<usize> = None;
                for &i in candidates {
                    let weight = i64::from(self.endpoints[i].endpoint.weight);
                    selection.weights[i] += weight;
                    total += weight;
                    if best.map_or(true, |b| selection.weights[i] > selection.weights[b]) {
                        best = Some(i);
                    }
                }
                match best {
                    Some(chosen) => {
                        selection.weights[chosen] -= total;
                        chosen
                    }
                    None => current,
                }
            }
            LoadBalancingStrategy::Random => candidates[fastrand::usize(..candidates.len())],
        }
    }

    /// Report a successful operation. Closes a half-open breaker.
    pub fn record_success(&self) {
        if let Some(breaker) = &self.breaker {
            let before = breaker.state();
            if breaker.record_success() == CircuitState::Closed && before == CircuitState::HalfOpen {
                let current = self.get_current_endpoint();
                log_failover_event("circuit_closed", None, Some(&current.address), None);
            }
        }
    }

    /// Count an in-flight operation against the current endpoint until the
    /// returned guard is dropped
    pub fn begin_operation(&self) -> ActiveOperation<'_> {
        let index = self.selection.read().current;
        let state = &self.endpoints[index];
        state.active_operations.fetch_add(1, Ordering::AcqRel);
        ActiveOperation { state }
    }

    /// Run `operation` against the current endpoint, rotating on endpoint
    /// failures. Request-level errors (a missing document, a CAS mismatch) say
    /// nothing about endpoint health and are returned unchanged.
    pub fn execute<T, F>(&self, mut operation: F) -> ClientResult<T>
    where
        F: FnMut(&Endpoint) -> ClientResult<T>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_delay;
        let mut attempts = 0u32;

        loop {
            self.ensure_available()?;
            let result = {
                let active = self.begin_operation();
                operation(active.endpoint())
            };
            attempts += 1;

            let error = match result {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(error) if !error.is_endpoint_failure() => {
                    self.record_success();
                    return Err(error);
                }
                Err(error) => error,
            };

            warn!(attempt = attempts, error = %error, "Endpoint operation failed");
            self.handle_failure()?;

            if attempts >= max_attempts {
                return Err(ClientError::FailoverExhausted { attempts });
            }
            if started.elapsed() + delay > self.config.timeout {
                return Err(ClientError::Timeout(format!(
                    "failover budget of {:?} exceeded after {attempts} attempts: {error}",
                    self.config.timeout
                )));
            }
            thread::sleep(delay);
            delay = self.next_delay(delay);
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let nanos = (delay.as_nanos() as f64 * self.config.backoff_multiplier)
            .min(self.config.max_delay.as_nanos() as f64);
        Duration::from_nanos(nanos as u64)
    }

    /// Probe every endpoint if `health_check_interval` has elapsed since the
    /// last round. Returns whether a round ran.
    pub fn run_health_checks(&self) -> bool {
        if self.probe.is_none() {
            return false;
        }
        {
            let mut last = self.last_health_check.lock();
            if last.is_some_and(|at| at.elapsed() < self.config.health_check_interval) {
                return false;
            }
            *last = Some(Instant::now());
        }
        self.check_endpoints();
        true
    }

    /// Probe every endpoint now and return how many are healthy
    pub fn check_endpoints(&self) -> usize {
        let Some(probe) = &self.probe else {
            return self.healthy_endpoints();
        };
        for state in &self.endpoints {
            let healthy = probe.probe(&state.endpoint);
            let was_healthy = state.healthy.swap(healthy, Ordering::AcqRel);
            if was_healthy != healthy {
                info!(
                    endpoint = %state.endpoint,
                    healthy = healthy,
                    "🩺 Endpoint health changed"
                );
            }
        }
        self.healthy_endpoints()
    }

    /// Override the health of `address`. Returns false for an unknown address.
    pub fn mark_endpoint_health(&self, address: &str, healthy: bool) -> bool {
        match self.endpoints.iter().find(|s| s.endpoint.address == address) {
            Some(state) => {
                state.healthy.store(healthy, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_endpoint_healthy(&self, address: &str) -> Option<bool> {
        self.endpoints
            .iter()
            .find(|s| s.endpoint.address == address)
            .map(|s| s.healthy.load(Ordering::Acquire))
    }

    fn healthy_endpoints(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|s| s.healthy.load(Ordering::Acquire))
            .count()
    }

    /// Probe endpoints every `health_check_interval` on a background thread.
    /// Returns `None` when health checks are disabled or no probe is set.
    pub fn start_health_monitor(self: &Arc<Self>) -> ClientResult<Option<PeriodicTask>> {
        if !self.config.health_check_enabled || self.probe.is_none() {
            return Ok(None);
        }
        let manager: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn(
            "docstore-health-monitor",
            self.config.health_check_interval,
            move || match manager.upgrade() {
                Some(manager) => {
                    manager.check_endpoints();
                    *manager.last_health_check.lock() = Some(Instant::now());
                    true
                }
                None => false,
            },
        )?;
        Ok(Some(task))
    }

    pub fn stats(&self) -> FailoverStats {
        FailoverStats {
            current_endpoint: self.get_current_endpoint().address,
            circuit_state: self.circuit_state(),
            failovers: self.failovers.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            healthy_endpoints: self.healthy_endpoints(),
        }
    }

    fn short_circuit(&self, operation: &str) -> ClientError {
        self.short_circuited.fetch_add(1, Ordering::Relaxed);
        debug!(
            operation = operation,
            remaining_ms = self
                .breaker
                .as_ref()
                .and_then(CircuitBreaker::remaining_open_time)
                .map(|d| d.as_millis() as u64),
            "Circuit open, failing fast"
        );
        ClientError::CircuitBreakerOpen {
            component: BREAKER_NAME.to_string(),
        }
    }
}

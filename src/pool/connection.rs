//! Pooled connection metadata and the factory that opens connections.

use crate::error::ClientResult;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Opens, checks and closes the connections a [`ConnectionPool`](super::ConnectionPool) manages.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Handle: Send + 'static;

    fn connect(&self) -> ClientResult<Self::Handle>;

    /// Whether `handle` can still serve requests
    fn validate(&self, _handle: &Self::Handle) -> bool {
        true
    }

    /// Release the resources behind `handle`
    fn destroy(&self, handle: Self::Handle) {
        drop(handle);
    }
}

/// A store handle plus the bookkeeping the pool needs to recycle it
pub struct Connection<H> {
    id: Uuid,
    handle: H,
    created_at: Instant,
    last_used: Instant,
    last_validated: Instant,
    use_count: u64,
    is_valid: bool,
    pub(crate) generation: u64,
}

impl<H> Connection<H> {
    pub(crate) fn new(handle: H, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            handle,
            created_at: now,
            last_used: now,
            last_validated: now,
            use_count: 0,
            is_valid: true,
            generation,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Mark the connection broken so the pool destroys it instead of recycling it
    pub fn invalidate(&mut self) {
        self.is_valid = false;
    }

    pub fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.age() >= ttl)
    }

    pub(crate) fn needs_validation(&self, interval: Duration) -> bool {
        self.last_validated.elapsed() >= interval
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    pub(crate) fn mark_validated(&mut self, valid: bool) {
        self.last_validated = Instant::now();
        self.is_valid = valid;
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}

impl<H> fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("age", &self.age())
            .field("use_count", &self.use_count)
            .field("is_valid", &self.is_valid)
            .finish()
    }
}

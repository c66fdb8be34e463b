//! Periodic background work on a dedicated, named thread.
//!
//! Pool maintenance and endpoint health monitoring both run a closure on a
//! fixed interval until their owner goes away. The thread is stopped and
//! joined when the [`PeriodicTask`] handle is dropped.

use crate::error::{ClientError, ClientResult};
use crossbeam::channel::{bounded, select, tick, Sender};
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

pub struct PeriodicTask {
    name: String,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn `name` running `work` every `interval`. `work` returns `false`
    /// to stop the loop on its own, e.g. when a weak owner reference is gone.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut work: F) -> ClientResult<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if interval.is_zero() {
            return Err(ClientError::InvalidArgument(
                "background task interval must be greater than zero".to_string(),
            ));
        }
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let ticker = tick(interval);
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(task = %thread_name, "Background task started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if !work() {
                                break;
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!(task = %thread_name, "Background task stopped");
            })
            .map_err(|e| {
                ClientError::InvalidArgument(format!("failed to spawn background task {name}: {e}"))
            })?;

        Ok(Self {
            name,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the loop and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // Disconnecting the channel wakes the select
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

impl fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &!self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_until_dropped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PeriodicTask::spawn("test-ticker", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        task.stop();
        let observed = runs.load(Ordering::SeqCst);
        assert!(observed >= 2, "expected several ticks, saw {observed}");

        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), observed);
    }

    #[test]
    fn test_work_can_stop_the_loop() {
        let task = PeriodicTask::spawn("self-stopping", Duration::from_millis(2), || false).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(task.is_finished());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(PeriodicTask::spawn("zero", Duration::ZERO, || true).is_err());
    }
}

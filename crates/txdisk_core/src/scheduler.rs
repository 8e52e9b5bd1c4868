//! Background work.
//!
//! The engine never spawns ad-hoc threads for deferred work; it hands
//! closures to a [`WorkScheduler`]. Embedders can supply their own (a
//! pool, a container's work manager); [`ThreadScheduler`] runs each job on
//! a named thread.

use crate::error::{TxError, TxResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs background work.
pub trait WorkScheduler: Send + Sync + fmt::Debug {
    /// Runs `job` at some later point, off the caller's thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the work cannot be accepted.
    fn schedule(&self, name: &str, job: Job) -> TxResult<()>;
}

/// Runs every job on its own named thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl WorkScheduler for ThreadScheduler {
    fn schedule(&self, name: &str, job: Job) -> TxResult<()> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(job)
            .map(|_| ())
            .map_err(|e| {
                error!(name, error = %e, "could not start background work");
                TxError::Io(e)
            })
    }
}

/// A stop flag that sleepers can wait on.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    /// Sleeps for `interval` or until stopped. Returns true if stopped.
    pub(crate) fn wait(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.cond.wait_for(&mut stopped, interval);
        }
        *stopped
    }
}

/// A thread that runs `tick` every `interval` until stopped.
#[derive(Debug)]
pub(crate) struct PeriodicTask {
    name: String,
    signal: Arc<StopSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub(crate) fn start(
        name: &str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> TxResult<Self> {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            while !thread_signal.wait(interval) {
                tick();
            }
        })?;
        debug!(name, ?interval, "periodic task started");
        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn stop(&self) {
        self.signal.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!(name = %self.name, "periodic task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Named worker threads with a cooperative stop protocol.
//!
//! A worker moves through `Idle -> Running -> Stopped`, or through
//! `StopRequested` when asked to finish early. Stopping is a blocking join
//! that hands back whatever the worker's closure returned, which is how the
//! capture engine travels back to its owner once the preview loop ends.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};

/// Lifecycle of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, closure not entered yet.
    Idle,
    /// Closure running.
    Running,
    /// Asked to finish; the closure has not returned yet.
    StopRequested,
    /// Closure returned.
    Stopped,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<WorkerState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: WorkerState) {
        *self.lock() = state;
        self.changed.notify_all();
    }
}

/// Handed to the worker closure so it can notice stop requests.
#[derive(Debug, Clone)]
pub struct StopToken {
    shared: Arc<Shared>,
}

impl StopToken {
    /// Whether the owner asked the worker to finish.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        *self.shared.lock() == WorkerState::StopRequested
    }

    /// Sleep up to `timeout`, waking early on a stop request.
    ///
    /// Returns `true` if a stop was requested.
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while *state != WorkerState::StopRequested {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// A running worker thread whose closure produces a `T`.
#[derive(Debug)]
pub struct Worker<T> {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn a named thread running `body`.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(StopToken) -> T + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState::Idle),
            changed: Condvar::new(),
        });
        let token = StopToken {
            shared: Arc::clone(&shared),
        };
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                {
                    let mut state = token.shared.lock();
                    if *state == WorkerState::Idle {
                        *state = WorkerState::Running;
                    }
                }
                token.shared.changed.notify_all();
                let shared = Arc::clone(&token.shared);
                let output = body(token);
                shared.set(WorkerState::Stopped);
                output
            })?;
        debug!(worker = name, "spawned");
        Ok(Self {
            name: name.to_owned(),
            shared,
            handle: Some(handle),
        })
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.shared.lock()
    }

    /// Ask the worker to finish without waiting for it.
    pub fn request_stop(&self) {
        let mut state = self.shared.lock();
        if matches!(*state, WorkerState::Idle | WorkerState::Running) {
            *state = WorkerState::StopRequested;
        }
        drop(state);
        self.shared.changed.notify_all();
    }

    /// Whether the closure has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == WorkerState::Stopped
    }

    /// Request a stop and wait for the closure's output.
    pub fn stop(self) -> Result<T> {
        self.request_stop();
        self.join()
    }

    /// Wait for the closure to return on its own.
    pub fn join(mut self) -> Result<T> {
        let handle = self.handle.take().ok_or(CaptureError::InvalidState {
            operation: "join",
            state: "joined",
        })?;
        let output = handle.join().map_err(|_| {
            warn!(worker = %self.name, "worker panicked");
            CaptureError::Io(std::io::Error::other(format!("worker {} panicked", self.name)))
        })?;
        debug!(worker = %self.name, "joined");
        Ok(output)
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            {
                let mut state = self.shared.lock();
                if matches!(*state, WorkerState::Idle | WorkerState::Running) {
                    *state = WorkerState::StopRequested;
                }
            }
            self.shared.changed.notify_all();
            if handle.join().is_err() {
                warn!(worker = %self.name, "worker panicked during drop");
            }
        }
    }
}

//! Ordered shutdown.
//!
//! Termination runs a fixed list of named actions in order. Every action is
//! isolated: an error or a panic is logged and the remaining actions still
//! run. Each action runs at most once.
//!
//! The worker pool is stopped in two steps. [`WorkerPool::initiate_shutdown`]
//! starts the runtime teardown on a separate thread and returns at once, so
//! that later actions (flushing the tile store) overlap with it, and
//! [`WorkerPool::await_shutdown`] joins that thread as the final action.

use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, error, info};

use crate::error::ShutdownError;

/// Time given to in-flight runtime tasks once shutdown starts.
pub const DEFAULT_POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type Action = Box<dyn FnOnce() -> Result<(), ShutdownError> + Send>;

struct Hook {
    name: &'static str,
    action: Option<Action>,
}

// =============================================================================
// Shutdown Hooks
// =============================================================================

/// Ordered list of shutdown actions.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Vec<Hook>,
    last: Option<Hook>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action.
    pub fn add<F>(&mut self, name: &'static str, action: F) -> &mut Self
    where
        F: FnOnce() -> Result<(), ShutdownError> + Send + 'static,
    {
        self.hooks.push(Hook {
            name,
            action: Some(Box::new(action)),
        });
        self
    }

    /// Set the action that runs after all others, replacing any previous one.
    pub fn add_last<F>(&mut self, name: &'static str, action: F) -> &mut Self
    where
        F: FnOnce() -> Result<(), ShutdownError> + Send + 'static,
    {
        self.last = Some(Hook {
            name,
            action: Some(Box::new(action)),
        });
        self
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.iter().chain(self.last.iter()).map(|h| h.name).collect()
    }

    /// Run every action that has not run yet, in order.
    ///
    /// Returns the failures; they have already been logged.
    pub fn run(&mut self) -> Vec<ShutdownError> {
        let started = Instant::now();
        let mut failures = Vec::new();

        for hook in self.hooks.iter_mut().chain(self.last.iter_mut()) {
            let Some(action) = hook.action.take() else {
                debug!(action = hook.name, "Shutdown action already ran");
                continue;
            };

            let step = Instant::now();
            let result = match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(result) => result,
                Err(payload) => Err(ShutdownError::Panicked {
                    action: hook.name,
                    message: panic_message(payload.as_ref()),
                }),
            };

            match result {
                Ok(()) => info!(
                    action = hook.name,
                    elapsed_ms = step.elapsed().as_millis() as u64,
                    "Shutdown action complete"
                ),
                Err(e) => {
                    error!(action = hook.name, error = %e, "Shutdown action failed");
                    failures.push(e);
                }
            }
        }

        info!(
            failures = failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Shutdown sequence finished"
        );
        failures
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// The multi-threaded runtime that serves connections.
pub struct WorkerPool {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    teardown: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl WorkerPool {
    /// Build a runtime with `workers` worker threads.
    pub fn new(workers: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("tile-worker")
            .enable_all()
            .build()?;
        Ok(Self::from_runtime(runtime))
    }

    pub fn from_runtime(runtime: Runtime) -> Self {
        Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            teardown: Mutex::new(None),
            timeout: DEFAULT_POOL_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `future` to completion on the pool from a non-runtime thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Start tearing down the runtime without waiting for it.
    pub fn initiate_shutdown(&self) -> Result<(), ShutdownError> {
        let runtime = self
            .runtime
            .lock()
            .take()
            .ok_or(ShutdownError::AlreadyRan("initiate worker shutdown"))?;

        let timeout = self.timeout;
        let teardown = std::thread::Builder::new()
            .name("tile-worker-shutdown".to_string())
            .spawn(move || runtime.shutdown_timeout(timeout))
            .map_err(|e| ShutdownError::Failed {
                action: "initiate worker shutdown",
                message: e.to_string(),
            })?;

        *self.teardown.lock() = Some(teardown);
        debug!(timeout_secs = timeout.as_secs(), "Worker pool shutdown initiated");
        Ok(())
    }

    /// Wait for the teardown started by [`initiate_shutdown`](Self::initiate_shutdown).
    pub fn await_shutdown(&self) -> Result<(), ShutdownError> {
        let teardown = self.teardown.lock().take().ok_or_else(|| ShutdownError::Failed {
            action: "await worker shutdown",
            message: "shutdown was not initiated".to_string(),
        })?;

        teardown.join().map_err(|payload| ShutdownError::Panicked {
            action: "await worker shutdown",
            message: panic_message(payload.as_ref()),
        })?;
        info!("Worker pool stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

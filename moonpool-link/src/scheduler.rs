//! Explicitly owned task scheduler shared by link managers.
//!
//! A [`Scheduler`] is created by the client and handed to every manager it
//! builds. Each manager takes a [`SchedulerLease`] for as long as its engine
//! runs; when the last lease is released the scheduler shuts down and every
//! task it spawned (engines, retry timers, token renewal loops) is cancelled.
//! There is no process-wide scheduler.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{LinkError, LinkResult};

/// Spawns named tasks and tracks how many managers still use it.
#[derive(Clone, Debug)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug)]
struct SchedulerInner {
    handle: Handle,
    shutdown: CancellationToken,
    leases: AtomicUsize,
}

impl Scheduler {
    /// Scheduler spawning onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                handle,
                shutdown: CancellationToken::new(),
                leases: AtomicUsize::new(0),
            }),
        }
    }

    /// Scheduler spawning onto the runtime the caller runs in.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::IllegalState`](crate::ErrorKind::IllegalState)
    /// outside a tokio runtime.
    pub fn current() -> LinkResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| LinkError::illegal_state(format!("no tokio runtime: {}", e)))
    }

    /// Register a user of the scheduler.
    ///
    /// # Errors
    ///
    /// Fails once the scheduler shut down.
    pub fn lease(&self) -> LinkResult<SchedulerLease> {
        if self.is_shutdown() {
            return Err(LinkError::illegal_state("scheduler is shut down"));
        }
        let previous = self.inner.leases.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(leases = previous + 1, "scheduler lease acquired");
        Ok(SchedulerLease {
            scheduler: self.clone(),
        })
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.inner.leases.load(Ordering::Acquire)
    }

    /// Spawn a named task that stops when the scheduler shuts down.
    pub fn spawn_task<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.to_string();
        let shutdown = self.inner.shutdown.clone();
        self.inner.handle.spawn(async move {
            tracing::trace!("Task {} starting", task_name);
            tokio::select! {
                _ = future => tracing::trace!("Task {} completed", task_name),
                _ = shutdown.cancelled() => tracing::trace!("Task {} cancelled", task_name),
            }
        })
    }

    /// Token cancelled when the scheduler shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Cancel every task, regardless of outstanding leases.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::debug!("scheduler shutting down");
            self.inner.shutdown.cancel();
        }
    }

    /// Whether the scheduler shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Keeps a [`Scheduler`] alive. The last lease dropped shuts it down.
#[derive(Debug)]
pub struct SchedulerLease {
    scheduler: Scheduler,
}

impl SchedulerLease {
    /// The leased scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for SchedulerLease {
    fn drop(&mut self) {
        let previous = self.scheduler.inner.leases.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.scheduler.shutdown();
        }
    }
}

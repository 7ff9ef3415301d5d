//! Process-wide bounded pool for job loops.
//!
//! Job loops are long-lived and blocking (they sleep between runs and their
//! routines talk to databases over synchronous drivers), so they run on the
//! blocking threads of a dedicated tokio runtime. A semaphore caps how many
//! loops may hold a thread at once: a loop that cannot get a slot is refused
//! with [`SchedulerError::PoolExhausted`] instead of queueing behind loops
//! that may never finish.

use std::sync::{Arc, OnceLock};

use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::SchedulerError;

static GLOBAL_POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

/// Bounded executor shared by every [`AsyncJob`](crate::job::AsyncJob).
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Option<Runtime>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// Creates a pool running at most `max_jobs` job loops concurrently.
    pub fn new(max_jobs: usize) -> Result<Self, SchedulerError> {
        Self::from_config(&PoolConfig { max_jobs })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_jobs)
            .thread_name("dbm-job")
            .build()?;
        debug!(max_jobs = config.max_jobs, "worker pool started");
        Ok(Self {
            runtime: Some(runtime),
            slots: Arc::new(Semaphore::new(config.max_jobs)),
            capacity: config.max_jobs,
        })
    }

    /// The process-wide pool, created with default settings on first use.
    pub fn global() -> Result<Arc<Self>, SchedulerError> {
        Self::init_global(&PoolConfig::default())
    }

    /// The process-wide pool, created from `config` if it does not exist yet.
    /// Later calls return the existing pool regardless of `config`.
    pub fn init_global(config: &PoolConfig) -> Result<Arc<Self>, SchedulerError> {
        if let Some(pool) = GLOBAL_POOL.get() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(Self::from_config(config)?);
        Ok(Arc::clone(GLOBAL_POOL.get_or_init(|| pool)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free job slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Runs `task` on a pool thread, holding one slot until it returns.
    pub(crate) fn submit<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = self.runtime.as_ref().ok_or(SchedulerError::PoolShutdown)?;
        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => SchedulerError::PoolExhausted {
                    capacity: self.capacity,
                },
                TryAcquireError::Closed => SchedulerError::PoolShutdown,
            })?;
        let _detached = runtime.spawn_blocking(move || {
            let _slot = permit;
            task();
        });
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.slots.close();
        if let Some(runtime) = self.runtime.take() {
            // Loops observe cancellation on their own; do not block on them here.
            runtime.shutdown_background();
        }
    }
}

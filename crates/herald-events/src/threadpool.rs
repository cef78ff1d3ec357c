//! Background dispatch on a rayon thread pool.
//!
//! [`PoolExecutor`] backs [`DispatchPolicy::Background`](crate::DispatchPolicy::Background).
//! Batches are spawned onto a work-stealing pool, so two batches from the same
//! channel may run concurrently and in any order relative to each other. The
//! consumers inside one batch still run in priority order.
//!
//! # Example
//!
//! ```
//! use herald_events::{Executor, PoolExecutor, ThreadPoolConfig};
//!
//! let pool = PoolExecutor::new(ThreadPoolConfig::with_threads(2)).unwrap();
//! assert_eq!(pool.num_threads(), 2);
//! assert_eq!(pool.name(), "herald-pool");
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::{ThreadPool as RayonThreadPool, ThreadPoolBuilder};

use crate::dispatch::DispatchTask;
use crate::error::{EventError, Result};
use crate::executor::Executor;

/// Configuration for the background dispatch pool.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads. `None` means use the number of CPU cores.
    pub num_threads: Option<usize>,
    /// Name prefix for worker threads.
    pub thread_name: String,
    /// Stack size for worker threads in bytes.
    pub stack_size: Option<usize>,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            thread_name: "herald-pool".to_string(),
            stack_size: None,
        }
    }
}

impl ThreadPoolConfig {
    /// Create a new configuration with custom thread count.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
            ..Default::default()
        }
    }

    /// Set the thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Executor that spawns dispatch tasks onto a private rayon pool.
pub struct PoolExecutor {
    name: String,
    pool: RayonThreadPool,
    active_tasks: Arc<AtomicUsize>,
}

impl PoolExecutor {
    /// Create a new pool with the given configuration.
    pub fn new(config: ThreadPoolConfig) -> Result<Self> {
        let prefix = config.thread_name.clone();
        let mut builder =
            ThreadPoolBuilder::new().thread_name(move |index| format!("{prefix}-{index}"));

        if let Some(num_threads) = config.num_threads {
            builder = builder.num_threads(num_threads);
        }

        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let pool = builder
            .build()
            .map_err(|e| EventError::ExecutorCreation(e.to_string()))?;

        Ok(Self {
            name: config.thread_name,
            pool,
            active_tasks: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Get the number of threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Number of tasks spawned but not yet finished.
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    /// Returns `true` if the calling thread belongs to this pool.
    pub fn is_pool_thread(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }
}

impl Executor for PoolExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, task: DispatchTask) -> Result<()> {
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        let active_tasks = self.active_tasks.clone();
        self.pool.spawn(move || {
            task.run_detached();
            active_tasks.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(())
    }
}

impl fmt::Debug for PoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolExecutor")
            .field("name", &self.name)
            .field("num_threads", &self.num_threads())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

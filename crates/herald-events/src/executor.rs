//! Dispatch policies and the executors behind them.
//!
//! Every consumer declares a [`DispatchPolicy`] when it is registered. The
//! policy is resolved to a concrete [`Executor`] at registration time, and
//! the channel never runs that consumer anywhere else.
//!
//! # Built-in Policies
//!
//! - **Immediate**: run on the publishing thread, before `publish` returns (default)
//! - **Background**: run on a shared rayon pool
//! - **Dedicated**: run on a single serial worker thread
//! - **Deferred**: run on a fresh thread per dispatch
//! - **Named**: run on an executor bound by name when the service was built
//! - **Custom**: run on an executor supplied directly

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::dispatch::DispatchTask;
use crate::error::{EventError, Result};
use crate::logging::targets;
use crate::threadpool::{PoolExecutor, ThreadPoolConfig};
use crate::worker::{WorkerConfig, WorkerExecutor};

/// Runs dispatch tasks according to some threading policy.
///
/// Implementations must run each task exactly once, or reject it with an
/// error. Tasks run away from the caller should use
/// [`DispatchTask::run_detached`].
pub trait Executor: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Run or schedule one dispatch task.
    fn execute(&self, task: DispatchTask) -> Result<()>;
}

/// Where a consumer's handler runs.
#[derive(Clone, Default)]
pub enum DispatchPolicy {
    /// On the publishing thread, before `publish` returns.
    #[default]
    Immediate,
    /// On the shared background pool.
    Background,
    /// On the service's dedicated serial worker thread.
    Dedicated,
    /// On a new thread spawned for each dispatch.
    Deferred,
    /// On the executor bound under this name at startup.
    Named(Arc<str>),
    /// On this executor.
    Custom(Arc<dyn Executor>),
}

impl DispatchPolicy {
    /// Policy for an executor bound by name.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self::Named(name.into())
    }

    /// Policy for an executor supplied directly.
    pub fn custom(executor: impl Executor + 'static) -> Self {
        Self::Custom(Arc::new(executor))
    }
}

impl fmt::Debug for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("Immediate"),
            Self::Background => f.write_str("Background"),
            Self::Dedicated => f.write_str("Dedicated"),
            Self::Deferred => f.write_str("Deferred"),
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Custom(executor) => f.debug_tuple("Custom").field(&executor.name()).finish(),
        }
    }
}

/// Runs tasks synchronously on the calling thread.
///
/// This is the only executor whose escalated failures reach the publisher.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn name(&self) -> &str {
        "immediate"
    }

    fn execute(&self, task: DispatchTask) -> Result<()> {
        task.run()
    }
}

/// Spawns a new, named thread for every task.
#[derive(Debug)]
pub struct DeferredThreadExecutor {
    thread_name: String,
    spawned: AtomicU64,
}

impl DeferredThreadExecutor {
    /// Create an executor naming its threads `{thread_name}-{n}`.
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            spawned: AtomicU64::new(0),
        }
    }

    /// Number of threads spawned so far.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Acquire)
    }
}

impl Default for DeferredThreadExecutor {
    fn default() -> Self {
        Self::new("herald-deferred")
    }
}

impl Executor for DeferredThreadExecutor {
    fn name(&self) -> &str {
        &self.thread_name
    }

    fn execute(&self, task: DispatchTask) -> Result<()> {
        let index = self.spawned.fetch_add(1, Ordering::AcqRel);
        thread::Builder::new()
            .name(format!("{}-{}", self.thread_name, index))
            .spawn(move || task.run_detached())
            .map(|_| ())
            .map_err(|err| EventError::rejected(self.thread_name.clone(), err.to_string()))
    }
}

/// Returns `true` if both handles point at the same executor instance.
pub(crate) fn same_executor(a: &Arc<dyn Executor>, b: &Arc<dyn Executor>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Resolves dispatch policies to executors for one event service.
///
/// The background pool and dedicated worker are only started the first time
/// a consumer asks for them.
pub(crate) struct ExecutorRegistry {
    immediate: Arc<dyn Executor>,
    deferred: Arc<dyn Executor>,
    background: Mutex<Option<Arc<dyn Executor>>>,
    dedicated: Mutex<Option<Arc<dyn Executor>>>,
    named: HashMap<Arc<str>, Arc<dyn Executor>>,
    pool_config: ThreadPoolConfig,
    worker_config: WorkerConfig,
}

impl ExecutorRegistry {
    pub(crate) fn new(
        pool_config: ThreadPoolConfig,
        worker_config: WorkerConfig,
        named: HashMap<Arc<str>, Arc<dyn Executor>>,
    ) -> Self {
        Self {
            immediate: Arc::new(ImmediateExecutor),
            deferred: Arc::new(DeferredThreadExecutor::default()),
            background: Mutex::new(None),
            dedicated: Mutex::new(None),
            named,
            pool_config,
            worker_config,
        }
    }

    /// Fail early if `policy` names an executor that was never bound.
    pub(crate) fn check(&self, policy: &DispatchPolicy) -> Result<()> {
        match policy {
            DispatchPolicy::Named(name) if !self.named.contains_key(name) => {
                Err(EventError::UnknownPolicy(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn resolve(&self, policy: &DispatchPolicy) -> Result<Arc<dyn Executor>> {
        match policy {
            DispatchPolicy::Immediate => Ok(self.immediate.clone()),
            DispatchPolicy::Deferred => Ok(self.deferred.clone()),
            DispatchPolicy::Background => {
                let mut slot = self.background.lock();
                if let Some(pool) = slot.as_ref() {
                    return Ok(pool.clone());
                }
                let pool = PoolExecutor::new(self.pool_config.clone())?;
                let pool: Arc<dyn Executor> = Arc::new(pool);
                tracing::debug!(target: targets::EXECUTOR, "started background dispatch pool");
                *slot = Some(pool.clone());
                Ok(pool)
            }
            DispatchPolicy::Dedicated => {
                let mut slot = self.dedicated.lock();
                if let Some(worker) = slot.as_ref() {
                    return Ok(worker.clone());
                }
                let worker: Arc<dyn Executor> =
                    Arc::new(WorkerExecutor::with_config(self.worker_config.clone())?);
                tracing::debug!(target: targets::EXECUTOR, "started dedicated dispatch worker");
                *slot = Some(worker.clone());
                Ok(worker)
            }
            DispatchPolicy::Named(name) => self
                .named
                .get(name)
                .cloned()
                .ok_or_else(|| EventError::UnknownPolicy(name.to_string())),
            DispatchPolicy::Custom(executor) => Ok(executor.clone()),
        }
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new(
            ThreadPoolConfig::default(),
            WorkerConfig::default(),
            HashMap::new(),
        )
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .field("background_started", &self.background.lock().is_some())
            .field("dedicated_started", &self.dedicated.lock().is_some())
            .finish()
    }
}

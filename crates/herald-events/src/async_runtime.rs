//! Tokio integration.
//!
//! Requires the `tokio` feature:
//!
//! ```toml
//! [dependencies]
//! herald-events = { version = "1.0", features = ["tokio"] }
//! ```
//!
//! [`TokioExecutor`] runs dispatch batches on a runtime's blocking pool, so
//! consumers may block without stalling the runtime's async workers. Bind it
//! under a name and let consumers opt in with
//! [`DispatchPolicy::named`](crate::DispatchPolicy::named):
//!
//! ```no_run
//! use herald_events::{EventService, TokioExecutor};
//!
//! # fn main() -> herald_events::Result<()> {
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let service = EventService::builder()
//!     .bind_executor("tokio", TokioExecutor::new(runtime.handle().clone()))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use tokio::runtime::Handle;

use crate::dispatch::DispatchTask;
use crate::error::{EventError, Result};
use crate::executor::Executor;

/// Executor that hands tasks to a Tokio runtime's blocking pool.
#[derive(Clone)]
pub struct TokioExecutor {
    name: String,
    handle: Handle,
}

impl TokioExecutor {
    /// Create an executor for the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            name: "tokio".to_string(),
            handle,
        }
    }

    /// Create an executor for the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| EventError::ExecutorCreation(e.to_string()))
    }

    /// Set the name reported in diagnostics.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The runtime handle tasks are spawned on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Executor for TokioExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, task: DispatchTask) -> Result<()> {
        // The JoinHandle is dropped; the task still runs to completion.
        self.handle.spawn_blocking(move || task.run_detached());
        Ok(())
    }
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ChannelKey;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_current_outside_runtime_fails() {
        assert!(matches!(
            TokioExecutor::current(),
            Err(EventError::ExecutorCreation(_))
        ));
    }

    #[test]
    fn test_execute_on_blocking_pool() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("test-tokio")
            .build()
            .unwrap();
        let executor = TokioExecutor::new(runtime.handle().clone()).with_name("rt");
        assert_eq!(executor.name(), "rt");

        let (tx, rx) = bounded(1);
        executor
            .execute(DispatchTask::from_fn(ChannelKey::of::<u8>(None), move || {
                tx.send(Handle::try_current().is_ok()).unwrap();
                Ok(())
            }))
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_current_inside_runtime() {
        let executor = TokioExecutor::current().unwrap();
        assert_eq!(executor.name(), "tokio");
    }
}

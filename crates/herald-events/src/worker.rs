//! Serial dispatch on a dedicated background thread.
//!
//! [`WorkerExecutor`] backs [`DispatchPolicy::Dedicated`](crate::DispatchPolicy::Dedicated).
//! It owns one thread and a queue; batches run strictly in the order
//! they were submitted, which makes it the right home for consumers that must
//! observe events in publish order or that touch single-threaded resources.
//!
//! # Example
//!
//! ```
//! use herald_events::{Executor, WorkerBuilder};
//!
//! let worker = WorkerBuilder::new().name("audit").queue_capacity(64).build().unwrap();
//! assert_eq!(worker.name(), "audit");
//! assert!(worker.is_running());
//! worker.stop_and_join();
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::dispatch::DispatchTask;
use crate::error::{EventError, Result};
use crate::executor::Executor;
use crate::logging::targets;

/// Configuration for the dedicated dispatch worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for the worker thread.
    pub name: String,
    /// Stack size for the worker thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
    /// Capacity of the task queue. `None` (the default) never fills up;
    /// with a capacity, submissions beyond it are rejected.
    pub queue_capacity: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "herald-worker".to_string(),
            stack_size: None,
            queue_capacity: None,
        }
    }
}

impl WorkerConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for [`WorkerExecutor`].
#[derive(Debug, Default)]
pub struct WorkerBuilder {
    config: WorkerConfig,
}

impl WorkerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the stack size for the worker thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Bound the task queue. Unbounded unless set.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    /// Build and start the worker.
    pub fn build(self) -> Result<WorkerExecutor> {
        WorkerExecutor::with_config(self.config)
    }
}

/// State shared between the handle and the worker thread.
struct WorkerState {
    running: AtomicBool,
    finished: AtomicBool,
    pending_tasks: AtomicUsize,
    shutdown_condvar: Condvar,
    shutdown_mutex: Mutex<()>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            pending_tasks: AtomicUsize::new(0),
            shutdown_condvar: Condvar::new(),
            shutdown_mutex: Mutex::new(()),
        }
    }

    fn signal_shutdown(&self) {
        let _guard = self.shutdown_mutex.lock();
        self.finished.store(true, Ordering::Release);
        self.shutdown_condvar.notify_all();
    }
}

enum WorkerMessage {
    Run(DispatchTask),
    Shutdown,
}

/// Executor that runs every task on one dedicated thread, in submission order.
pub struct WorkerExecutor {
    name: String,
    sender: Sender<WorkerMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    state: Arc<WorkerState>,
}

impl WorkerExecutor {
    /// Start a worker with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(WorkerConfig::default())
    }

    /// Start a worker with custom configuration.
    pub fn with_config(config: WorkerConfig) -> Result<Self> {
        let (sender, receiver) = match config.queue_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let state = Arc::new(WorkerState::new());
        let thread_state = state.clone();

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(move || {
                worker_loop(receiver, &thread_state);
                thread_state.running.store(false, Ordering::Release);
                thread_state.signal_shutdown();
            })
            .map_err(|e| EventError::ExecutorCreation(e.to_string()))?;

        Ok(Self {
            name: config.name,
            sender,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
            state,
        })
    }

    /// Check if the worker is still accepting tasks.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Number of tasks queued but not yet finished.
    pub fn pending_tasks(&self) -> usize {
        self.state.pending_tasks.load(Ordering::Acquire)
    }

    /// Id of the worker thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Returns `true` if called from the worker thread.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop accepting tasks; the worker exits after draining its queue.
    ///
    /// Non-blocking. Use [`join`](Self::join) to wait for the thread.
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
        let _ = self.sender.try_send(WorkerMessage::Shutdown);
    }

    /// Wait for the worker thread to finish.
    ///
    /// Returns `false` if already joined or the thread panicked.
    pub fn join(&self) -> bool {
        let handle = self.handle.lock().take();
        match handle {
            // Joining ourselves would deadlock.
            Some(h) if !self.is_worker_thread() => h.join().is_ok(),
            _ => false,
        }
    }

    /// Stop the worker and wait for it to finish.
    pub fn stop_and_join(&self) -> bool {
        self.stop();
        self.join()
    }

    /// Wait up to `timeout` for the worker thread to exit.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.state.shutdown_mutex.lock();
        if self.state.finished.load(Ordering::Acquire) {
            return true;
        }
        self.state.shutdown_condvar.wait_for(&mut guard, timeout);
        self.state.finished.load(Ordering::Acquire)
    }
}

impl Executor for WorkerExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, task: DispatchTask) -> Result<()> {
        if !self.is_running() {
            return Err(EventError::rejected(self.name.clone(), "worker stopped"));
        }

        self.state.pending_tasks.fetch_add(1, Ordering::AcqRel);
        match self.sender.try_send(WorkerMessage::Run(task)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.pending_tasks.fetch_sub(1, Ordering::AcqRel);
                let reason = match err {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Disconnected(_) => "worker stopped",
                };
                Err(EventError::rejected(self.name.clone(), reason))
            }
        }
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        // The thread exits on its own once the queue drains.
        self.stop();
    }
}

impl fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

fn worker_loop(receiver: Receiver<WorkerMessage>, state: &WorkerState) {
    tracing::trace!(target: targets::EXECUTOR, "dispatch worker started");
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Run(task) => {
                task.run_detached();
                state.pending_tasks.fetch_sub(1, Ordering::AcqRel);
            }
            WorkerMessage::Shutdown => break,
        }
        // The shutdown message is dropped when stop() finds the queue full.
        if !state.running.load(Ordering::Acquire) && receiver.is_empty() {
            break;
        }
    }

    // Drain whatever was queued before shutdown was requested.
    while let Ok(WorkerMessage::Run(task)) = receiver.try_recv() {
        task.run_detached();
        state.pending_tasks.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::trace!(target: targets::EXECUTOR, "dispatch worker stopped");
}

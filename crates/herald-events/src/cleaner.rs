//! Removal of consumers whose owners have been dropped.
//!
//! Channels hold consumer owners weakly. When a publish meets a consumer whose
//! owner is gone, the consumer is skipped and the channel asks the
//! [`Cleaner`] to tidy it up later; publishing itself never takes the write
//! lock to remove anything.
//!
//! The cleaner also sweeps every registered channel periodically, which
//! catches stale consumers on channels nobody publishes to. With
//! [`CleanupPolicy::Manual`] no thread is started and the application drives
//! both steps through [`Cleaner::run_pending`] and [`Cleaner::sweep_all`].

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::error::{EventError, Result};
use crate::logging::{span_names, targets};

/// Interval between full sweeps when none is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

new_key_type! {
    /// Registration handle for a [`Cleanable`].
    pub struct CleanableId;
}

/// Something holding consumers that may go stale.
pub trait Cleanable: Send + Sync {
    /// Remove stale consumers if any were observed since the last cleanup.
    ///
    /// Cheap when nothing was observed. Returns the number removed.
    fn cleanup(&self) -> usize;

    /// Check every consumer for staleness, observed or not.
    ///
    /// Returns the number removed.
    fn sweep(&self) -> usize;
}

/// How stale consumers are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// A background thread handles cleanup requests as they arrive and
    /// sweeps everything every `interval`.
    Background {
        /// Time between full sweeps.
        interval: Duration,
    },
    /// Nothing runs on its own; see [`Cleaner::run_pending`] and
    /// [`Cleaner::sweep_all`].
    Manual,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::Background {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

type Registry = Arc<Mutex<SlotMap<CleanableId, Weak<dyn Cleanable>>>>;

/// Sending half given to channels so they can request cleanup.
#[derive(Clone)]
pub(crate) struct CleanerHandle {
    sender: Sender<Weak<dyn Cleanable>>,
}

impl CleanerHandle {
    pub(crate) fn enqueue(&self, cleanable: Weak<dyn Cleanable>) {
        if self.sender.send(cleanable).is_err() {
            tracing::trace!(target: targets::CLEANER, "cleaner gone, dropping cleanup request");
        }
    }
}

impl fmt::Debug for CleanerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanerHandle")
            .field("queued", &self.sender.len())
            .finish()
    }
}

/// Collects stale consumers from registered channels.
pub struct Cleaner {
    policy: CleanupPolicy,
    registry: Registry,
    sender: Sender<Weak<dyn Cleanable>>,
    receiver: Receiver<Weak<dyn Cleanable>>,
    thread: Mutex<Option<CleanerThread>>,
}

struct CleanerThread {
    handle: JoinHandle<()>,
    stop: Sender<()>,
}

impl Cleaner {
    /// Create a cleaner, starting its thread unless `policy` is manual.
    pub fn new(policy: CleanupPolicy) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let cleaner = Self {
            policy,
            registry: Arc::new(Mutex::new(SlotMap::with_key())),
            sender,
            receiver,
            thread: Mutex::new(None),
        };
        cleaner.start()?;
        Ok(cleaner)
    }

    /// The policy this cleaner was created with.
    pub fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    /// Start the background thread if the policy asks for one and it is not
    /// already running.
    pub fn start(&self) -> Result<()> {
        let CleanupPolicy::Background { interval } = self.policy else {
            return Ok(());
        };

        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let receiver = self.receiver.clone();
        let registry = self.registry.clone();
        let (stop, stopped) = bounded(1);
        let handle = thread::Builder::new()
            .name("herald-cleaner".to_string())
            .spawn(move || cleanup_loop(&receiver, &stopped, &registry, interval))
            .map_err(|e| EventError::ExecutorCreation(e.to_string()))?;
        *thread = Some(CleanerThread { handle, stop });
        tracing::debug!(target: targets::CLEANER, ?interval, "cleaner started");
        Ok(())
    }

    /// Ask the background thread to exit. Does not wait for it.
    ///
    /// Requests queued after this call stay queued until
    /// [`start`](Self::start) or [`run_pending`](Self::run_pending).
    pub fn stop(&self) {
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.stop.try_send(());
            tracing::debug!(target: targets::CLEANER, "cleaner stopping");
        }
    }

    /// Returns `true` while a started background thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|thread| !thread.handle.is_finished())
    }

    /// Include `cleanable` in periodic sweeps.
    pub fn add_cleanable(&self, cleanable: Weak<dyn Cleanable>) -> CleanableId {
        self.registry.lock().insert(cleanable)
    }

    /// Exclude a cleanable from periodic sweeps.
    pub fn remove_cleanable(&self, id: CleanableId) -> bool {
        self.registry.lock().remove(id).is_some()
    }

    /// Queue `cleanable` for a cleanup pass.
    pub fn enqueue_cleanable(&self, cleanable: Weak<dyn Cleanable>) {
        self.handle().enqueue(cleanable);
    }

    /// Number of registered cleanables, live or not.
    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    /// Number of queued cleanup requests.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Handle every queued cleanup request on the calling thread.
    ///
    /// Returns the number of consumers removed.
    pub fn run_pending(&self) -> usize {
        self.receiver.try_iter().map(|cleanable| clean_one(&cleanable)).sum()
    }

    /// Sweep every registered cleanable on the calling thread.
    ///
    /// Returns the number of consumers removed.
    pub fn sweep_all(&self) -> usize {
        sweep_registry(&self.registry)
    }

    pub(crate) fn handle(&self) -> CleanerHandle {
        CleanerHandle {
            sender: self.sender.clone(),
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleaner")
            .field("policy", &self.policy)
            .field("running", &self.is_running())
            .field("registered", &self.registered())
            .field("pending", &self.pending())
            .finish()
    }
}

fn clean_one(cleanable: &Weak<dyn Cleanable>) -> usize {
    cleanable.upgrade().map_or(0, |c| c.cleanup())
}

fn sweep_registry(registry: &Mutex<SlotMap<CleanableId, Weak<dyn Cleanable>>>) -> usize {
    let _span = tracing::debug_span!(target: targets::CLEANER, span_names::CLEANUP).entered();

    let live: Vec<Arc<dyn Cleanable>> = {
        let mut registry = registry.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.values().filter_map(Weak::upgrade).collect()
    };

    let removed: usize = live.iter().map(|c| c.sweep()).sum();
    tracing::debug!(
        target: targets::CLEANER,
        cleanables = live.len(),
        removed,
        "swept registered channels"
    );
    removed
}

fn cleanup_loop(
    receiver: &Receiver<Weak<dyn Cleanable>>,
    stopped: &Receiver<()>,
    registry: &Registry,
    interval: Duration,
) {
    let mut next_sweep = Instant::now() + interval;
    loop {
        let timeout = next_sweep.saturating_duration_since(Instant::now());
        let stop = select! {
            recv(stopped) -> _ => true,
            recv(receiver) -> request => match request {
                Ok(cleanable) => {
                    let removed = clean_one(&cleanable);
                    if removed > 0 {
                        tracing::trace!(target: targets::CLEANER, removed, "cleaned channel");
                    }
                    false
                }
                Err(_) => true,
            },
            default(timeout) => false,
        };
        if stop {
            break;
        }

        if Instant::now() >= next_sweep {
            sweep_registry(registry);
            next_sweep = Instant::now() + interval;
        }
    }
    tracing::debug!(target: targets::CLEANER, "cleaner stopped");
}

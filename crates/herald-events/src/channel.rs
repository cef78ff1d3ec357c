//! Typed broadcast channels.
//!
//! A [`Channel<T>`] is the endpoint for one [`ChannelKey`]. It keeps its
//! consumers grouped by executor, each group ordered by
//! `(priority, registration sequence)`, behind a single reader/writer lock:
//! publishing takes the read lock, so any number of threads can publish at
//! once, while registration and cleanup take the write lock.
//!
//! No user code runs while the lock is held. Publishing snapshots the live
//! consumers under the read lock, then evaluates filters and hands one batch
//! per interested executor off after the lock is released.
//!
//! # Example
//!
//! ```
//! use herald_events::{Consumer, EventService};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicI32, Ordering};
//!
//! # fn main() -> herald_events::Result<()> {
//! let service = EventService::new()?;
//! let channel = service.register_channel::<i32>(None);
//!
//! let total = Arc::new(AtomicI32::new(0));
//! let sink = total.clone();
//! let _subscription = channel.subscribe(
//!     Consumer::new(move |value: &i32| {
//!         sink.fetch_add(*value, Ordering::SeqCst);
//!     })
//!     .filter(|value| *value > 10),
//! )?;
//!
//! channel.publish(3)?;
//! channel.publish(15)?;
//! assert_eq!(total.load(Ordering::SeqCst), 15);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::cleaner::{Cleanable, CleanerHandle};
use crate::consumer::{Consumer, ConsumerBinding, ConsumerId, ConsumerOrder, Liveness};
use crate::dispatch::{Candidate, DispatchBatch, DispatchContext, guarded};
use crate::error::{EventError, Result};
use crate::executor::{Executor, ExecutorRegistry, same_executor};
use crate::handler::FailureStage;
use crate::key::ChannelKey;
use crate::logging::{span_names, targets};

/// Consumers of one executor, in dispatch order.
struct ExecutorGroup<T> {
    executor: Arc<dyn Executor>,
    consumers: BTreeMap<ConsumerOrder, Arc<ConsumerBinding<T>>>,
}

struct ChannelState<T> {
    next_sequence: u64,
    groups: Vec<ExecutorGroup<T>>,
}

impl<T> ChannelState<T> {
    fn consumer_count(&self) -> usize {
        self.groups.iter().map(|g| g.consumers.len()).sum()
    }

    fn has_stale(&self) -> bool {
        self.groups
            .iter()
            .any(|g| g.consumers.values().any(|b| b.is_stale()))
    }
}

struct ChannelShared<T> {
    key: ChannelKey,
    context: Arc<DispatchContext>,
    executors: Arc<ExecutorRegistry>,
    cleaner: CleanerHandle,
    needs_cleanup: AtomicBool,
    state: RwLock<ChannelState<T>>,
    this: Weak<ChannelShared<T>>,
}

impl<T: Send + Sync + 'static> ChannelShared<T> {
    /// Flag the channel and queue it for cleanup, once per pending cleanup.
    fn request_cleanup(&self) {
        if !self.needs_cleanup.swap(true, Ordering::AcqRel) {
            let this: Weak<dyn Cleanable> = self.this.clone();
            self.cleaner.enqueue(this);
        }
    }

    fn remove_stale(&self) -> usize {
        let _span =
            tracing::trace_span!(target: targets::CHANNEL, span_names::CLEANUP, channel = %self.key)
                .entered();

        // Removed bindings are dropped outside the lock.
        let mut stale = Vec::new();
        let mut state = self.state.write();
        for group in &mut state.groups {
            let orders: Vec<ConsumerOrder> = group
                .consumers
                .iter()
                .filter(|(_, binding)| binding.is_stale())
                .map(|(order, _)| *order)
                .collect();
            stale.extend(orders.iter().filter_map(|order| group.consumers.remove(order)));
        }
        state.groups.retain(|group| !group.consumers.is_empty());
        drop(state);

        let removed = stale.len();
        drop(stale);

        if removed > 0 {
            tracing::debug!(
                target: targets::CHANNEL,
                channel = %self.key,
                removed,
                "removed stale consumers"
            );
        }
        removed
    }

    fn remove_consumer(&self, id: ConsumerId) -> bool {
        let mut state = self.state.write();
        let removed = state.groups.iter_mut().find_map(|group| {
            let order = group.consumers.keys().find(|order| order.id() == id).copied()?;
            group.consumers.remove(&order)
        });
        if removed.is_some() {
            state.groups.retain(|group| !group.consumers.is_empty());
        }
        drop(state);

        match removed {
            Some(binding) => {
                tracing::debug!(
                    target: targets::CHANNEL,
                    channel = %self.key,
                    consumer = binding.name(),
                    "consumer removed"
                );
                true
            }
            None => false,
        }
    }
}

impl<T: Send + Sync + 'static> Cleanable for ChannelShared<T> {
    fn cleanup(&self) -> usize {
        if !self.needs_cleanup.swap(false, Ordering::AcqRel) {
            return 0;
        }
        self.remove_stale()
    }

    fn sweep(&self) -> usize {
        if !self.state.read().has_stale() {
            return 0;
        }
        self.needs_cleanup.store(false, Ordering::Release);
        self.remove_stale()
    }
}

/// Type-erased view of a channel used by the service and by subscriptions.
pub(crate) trait AnyChannel: Send + Sync {
    fn remove_consumer(&self, id: ConsumerId) -> bool;
    fn consumer_count(&self) -> usize;
}

impl<T: Send + Sync + 'static> AnyChannel for ChannelShared<T> {
    fn remove_consumer(&self, id: ConsumerId) -> bool {
        ChannelShared::remove_consumer(self, id)
    }

    fn consumer_count(&self) -> usize {
        self.state.read().consumer_count()
    }
}

/// A broadcast endpoint for events of type `T` on one topic.
///
/// Channels are cheap handles; clones refer to the same channel. Obtain one
/// from [`EventService::register_channel`](crate::EventService::register_channel)
/// or [`EventService::get_channel`](crate::EventService::get_channel).
pub struct Channel<T> {
    shared: Arc<ChannelShared<T>>,
}

impl<T: Send + Sync + 'static> Channel<T> {
    pub(crate) fn new(
        key: ChannelKey,
        context: Arc<DispatchContext>,
        executors: Arc<ExecutorRegistry>,
        cleaner: CleanerHandle,
    ) -> Self {
        let shared = Arc::new_cyclic(|this| ChannelShared {
            key,
            context,
            executors,
            cleaner,
            needs_cleanup: AtomicBool::new(false),
            state: RwLock::new(ChannelState {
                next_sequence: 0,
                groups: Vec::new(),
            }),
            this: this.clone(),
        });
        Self { shared }
    }

    /// The key this channel is registered under.
    pub fn key(&self) -> &ChannelKey {
        &self.shared.key
    }

    /// Register a consumer.
    ///
    /// The consumer's dispatch policy is resolved now; registration fails if
    /// it names an executor that was never bound or one that cannot start.
    /// The binding lives until it is removed with
    /// [`remove_consumer`](Self::remove_consumer) or, for owned consumers,
    /// until its owner is dropped.
    pub fn add_consumer(&self, consumer: Consumer<T>) -> Result<ConsumerId> {
        let executor = self.shared.executors.resolve(consumer.dispatch_policy())?;

        let mut state = self.shared.state.write();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let binding = Arc::new(consumer.into_binding(sequence));
        let order = binding.order();
        tracing::debug!(
            target: targets::CHANNEL,
            channel = %self.shared.key,
            consumer = binding.name(),
            priority = order.priority,
            executor = executor.name(),
            "consumer registered"
        );

        match state
            .groups
            .iter_mut()
            .find(|group| same_executor(&group.executor, &executor))
        {
            Some(group) => {
                group.consumers.insert(order, binding);
            }
            None => {
                let mut consumers = BTreeMap::new();
                consumers.insert(order, binding);
                state.groups.push(ExecutorGroup {
                    executor,
                    consumers,
                });
            }
        }
        Ok(order.id())
    }

    /// Register a consumer for as long as the returned guard lives.
    pub fn subscribe(&self, consumer: Consumer<T>) -> Result<Subscription> {
        let id = self.add_consumer(consumer)?;
        let shared: Arc<dyn AnyChannel> = self.shared.clone();
        Ok(Subscription {
            channel: Arc::downgrade(&shared),
            key: self.shared.key.clone(),
            id,
            active: true,
        })
    }

    /// Remove a consumer. Returns `false` if it was not registered.
    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        self.shared.remove_consumer(id)
    }

    /// Number of registered consumers, including stale ones not yet removed.
    pub fn consumer_count(&self) -> usize {
        self.shared.state.read().consumer_count()
    }

    /// Number of distinct executors with at least one consumer.
    pub fn executor_count(&self) -> usize {
        self.shared.state.read().groups.len()
    }

    /// Returns `true` if a stale consumer was seen since the last cleanup.
    pub fn needs_cleanup(&self) -> bool {
        self.shared.needs_cleanup.load(Ordering::Acquire)
    }

    /// Remove stale consumers if any were seen by a publish.
    ///
    /// A cheap check when nothing is pending. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        self.shared.cleanup()
    }

    /// Check every consumer and remove the stale ones.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Publish an event to every interested consumer.
    ///
    /// Consumers whose filter rejects the event are skipped. Each remaining
    /// consumer runs on its own executor, in priority order within that
    /// executor; executors with no interested consumer are not invoked.
    ///
    /// Consumer failures are reported to the exception handler and do not
    /// reach the caller. An executor refusing its batch is reported the same
    /// way, once per consumer in the batch, with [`FailureStage::Submit`].
    /// An error is returned only if the exception handler escalates a
    /// failure raised on this thread: by a filter, by a consumer with the
    /// immediate policy, or by a refused batch. Other executors still receive
    /// their batches in that case.
    pub fn publish(&self, event: T) -> Result<()> {
        self.publish_shared(Arc::new(event))
    }

    /// Publish an event that is already shared.
    #[tracing::instrument(
        skip_all,
        target = "herald_events::channel",
        name = "herald_events::publish",
        level = "trace",
        fields(channel = %self.shared.key)
    )]
    pub fn publish_shared(&self, event: Arc<T>) -> Result<()> {
        let (groups, stale) = self.snapshot();
        if stale {
            self.shared.request_cleanup();
        }

        let context = &self.shared.context;
        let mut batches = Vec::with_capacity(groups.len());
        for (executor, candidates) in groups {
            let mut batch = DispatchBatch::new(context.clone(), event.clone());
            for candidate in candidates {
                if !candidate.binding.accepts(&event) {
                    continue;
                }
                match guarded(|| candidate.binding.filter(&event)) {
                    Ok(true) => batch.push(candidate),
                    Ok(false) => {}
                    Err(error) => context.report(
                        &candidate.binding,
                        candidate.owner_ref(),
                        FailureStage::Filter,
                        error,
                    )?,
                }
            }
            if !batch.is_empty() {
                batches.push((executor, batch));
            }
        }

        let mut first_error: Option<EventError> = None;
        for (executor, batch) in batches {
            let batch = Arc::new(batch);
            let outcome = match executor.execute(batch.to_task()) {
                Ok(()) => Ok(()),
                Err(err @ EventError::Escalated { .. }) => Err(err),
                Err(err) => {
                    tracing::error!(
                        target: targets::CHANNEL,
                        channel = %self.shared.key,
                        executor = executor.name(),
                        error = %err,
                        "executor refused dispatch batch"
                    );
                    let reason = match err {
                        EventError::ExecutorRejected { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    batch.report_rejected(executor.name(), &reason)
                }
            };
            if let Err(err) = outcome {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Copy out the live consumers of every executor, pinning their owners.
    ///
    /// Returns the groups plus whether any stale consumer was seen.
    #[allow(clippy::type_complexity)]
    fn snapshot(&self) -> (Vec<(Arc<dyn Executor>, Vec<Candidate<T>>)>, bool) {
        let state = self.shared.state.read();
        let mut stale = false;
        let mut groups = Vec::with_capacity(state.groups.len());
        for group in &state.groups {
            let mut candidates = Vec::with_capacity(group.consumers.len());
            for binding in group.consumers.values() {
                let owner = match binding.liveness() {
                    Liveness::Stale => {
                        stale = true;
                        continue;
                    }
                    Liveness::Unowned => None,
                    Liveness::Alive(owner) => Some(owner),
                };
                candidates.push(Candidate {
                    binding: binding.clone(),
                    owner,
                });
            }
            if !candidates.is_empty() {
                groups.push((group.executor.clone(), candidates));
            }
        }
        (groups, stale)
    }

    /// Returns `true` if both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn erased(&self) -> Arc<dyn AnyChannel> {
        self.shared.clone()
    }

    pub(crate) fn cleanable(&self) -> Weak<dyn Cleanable> {
        let weak: Weak<ChannelShared<T>> = Arc::downgrade(&self.shared);
        weak
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("Channel")
            .field("key", &self.shared.key)
            .field("consumers", &state.consumer_count())
            .field("executors", &state.groups.len())
            .finish()
    }
}

/// Keeps a consumer registered; dropping it removes the consumer.
///
/// Returned by [`Channel::subscribe`]. The guard does not keep the channel
/// alive.
#[must_use = "dropping a Subscription removes the consumer immediately"]
pub struct Subscription {
    channel: Weak<dyn AnyChannel>,
    key: ChannelKey,
    id: ConsumerId,
    active: bool,
}

impl Subscription {
    /// The subscribed consumer.
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// The channel subscribed to.
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Remove the consumer now. Returns `false` if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.active = false;
        self.remove()
    }

    /// Leave the consumer registered and give up the guard.
    pub fn detach(mut self) -> ConsumerId {
        self.active = false;
        self.id
    }

    fn remove(&self) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|channel| channel.remove_consumer(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active {
            self.remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::{Cleaner, CleanupPolicy};
    use crate::executor::DispatchPolicy;
    use crate::handler::{
        ConsumerExceptionHandler, ConsumerFailure, FailureAction, LoggingExceptionHandler,
        ReturnHandlers,
    };
    use parking_lot::Mutex;

    fn channel_with<T: Send + Sync + 'static>(
        handler: Arc<dyn ConsumerExceptionHandler>,
        cleaner: &Cleaner,
    ) -> Channel<T> {
        let key = ChannelKey::of::<T>(None);
        let context = Arc::new(DispatchContext {
            key: key.clone(),
            exception_handler: handler,
            return_handlers: Arc::new(ReturnHandlers::new()),
        });
        Channel::new(
            key,
            context,
            Arc::new(ExecutorRegistry::default()),
            cleaner.handle(),
        )
    }

    fn channel<T: Send + Sync + 'static>(cleaner: &Cleaner) -> Channel<T> {
        channel_with(Arc::new(LoggingExceptionHandler), cleaner)
    }

    fn manual() -> Cleaner {
        Cleaner::new(CleanupPolicy::Manual).unwrap()
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl Fn(&i32) + Send + Sync + 'static {
        let log = log.clone();
        move |_: &i32| log.lock().push(name)
    }

    #[test]
    fn test_priority_then_registration_order() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        let log = Arc::new(Mutex::new(Vec::new()));

        channel.add_consumer(Consumer::new(recorder(&log, "A")).priority(5)).unwrap();
        channel.add_consumer(Consumer::new(recorder(&log, "B")).priority(1)).unwrap();
        channel.add_consumer(Consumer::new(recorder(&log, "C")).priority(1)).unwrap();

        channel.publish(1).unwrap();
        channel.publish(2).unwrap();
        assert_eq!(*log.lock(), vec!["B", "C", "A", "B", "C", "A"]);
    }

    #[test]
    fn test_negative_priority_runs_first() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        let log = Arc::new(Mutex::new(Vec::new()));

        channel.add_consumer(Consumer::new(recorder(&log, "zero"))).unwrap();
        channel.add_consumer(Consumer::new(recorder(&log, "minus")).priority(-3)).unwrap();

        channel.publish(0).unwrap();
        assert_eq!(*log.lock(), vec!["minus", "zero"]);
    }

    #[test]
    fn test_filter_gating() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel
            .add_consumer(Consumer::new(move |v: &i32| sink.lock().push(*v)).filter(|v| *v > 10))
            .unwrap();

        channel.publish(3).unwrap();
        channel.publish(15).unwrap();
        assert_eq!(*seen.lock(), vec![15]);
    }

    #[test]
    fn test_failure_is_isolated() {
        let cleaner = manual();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures_clone = failures.clone();
        let handler = move |failure: &ConsumerFailure<'_>| {
            failures_clone
                .lock()
                .push((failure.consumer.to_string(), failure.stage));
            FailureAction::Continue
        };
        let channel = channel_with::<i32>(Arc::new(handler), &cleaner);
        let log = Arc::new(Mutex::new(Vec::new()));

        channel
            .add_consumer(Consumer::new(|_: &i32| panic!("boom")).named("A").priority(0))
            .unwrap();
        channel.add_consumer(Consumer::new(recorder(&log, "B")).priority(1)).unwrap();

        assert!(channel.publish(1).is_ok());
        assert_eq!(*log.lock(), vec!["B"]);
        assert_eq!(
            *failures.lock(),
            vec![("A".to_string(), FailureStage::Consumer)]
        );
    }

    #[test]
    fn test_failing_filter_skips_consumer() {
        let cleaner = manual();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures_clone = failures.clone();
        let handler = move |failure: &ConsumerFailure<'_>| {
            failures_clone.lock().push(failure.stage);
            FailureAction::Continue
        };
        let channel = channel_with::<i32>(Arc::new(handler), &cleaner);
        let log = Arc::new(Mutex::new(Vec::new()));

        channel
            .add_consumer(
                Consumer::new(recorder(&log, "filtered")).try_filter(|_| Err::<bool, _>("bad")),
            )
            .unwrap();
        channel.add_consumer(Consumer::new(recorder(&log, "plain"))).unwrap();

        channel.publish(1).unwrap();
        assert_eq!(*log.lock(), vec!["plain"]);
        assert_eq!(*failures.lock(), vec![FailureStage::Filter]);
    }

    #[test]
    fn test_escalation_stops_the_batch() {
        let cleaner = manual();
        let handler = |_: &ConsumerFailure<'_>| FailureAction::Escalate;
        let channel = channel_with::<i32>(Arc::new(handler), &cleaner);
        let log = Arc::new(Mutex::new(Vec::new()));

        channel
            .add_consumer(Consumer::fallible(|_: &i32| Err("stop")).named("first"))
            .unwrap();
        channel.add_consumer(Consumer::new(recorder(&log, "second")).priority(1)).unwrap();

        match channel.publish(1) {
            Err(EventError::Escalated { consumer, .. }) => assert_eq!(consumer, "first"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_stale_owner_is_skipped_and_cleaned() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        let log = Arc::new(Mutex::new(Vec::new()));

        let owner = Arc::new(());
        channel
            .add_consumer(Consumer::new(recorder(&log, "owned")).owned_by(&owner))
            .unwrap();
        channel.add_consumer(Consumer::new(recorder(&log, "plain"))).unwrap();

        channel.publish(1).unwrap();
        drop(owner);
        channel.publish(2).unwrap();

        assert_eq!(*log.lock(), vec!["owned", "plain", "plain"]);
        assert!(channel.needs_cleanup());
        assert_eq!(channel.consumer_count(), 2);

        assert_eq!(cleaner.run_pending(), 1);
        assert!(!channel.needs_cleanup());
        assert_eq!(channel.consumer_count(), 1);
        assert_eq!(channel.cleanup(), 0);
    }

    #[test]
    fn test_sweep_finds_unobserved_stale_consumers() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        let owner = Arc::new(5_u8);
        channel.add_consumer(Consumer::new(|_: &i32| {}).owned_by(&owner)).unwrap();
        drop(owner);

        assert_eq!(channel.cleanup(), 0);
        assert_eq!(channel.sweep(), 1);
        assert_eq!(channel.consumer_count(), 0);
        assert_eq!(channel.executor_count(), 0);
    }

    #[test]
    fn test_remove_consumer() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = channel.add_consumer(Consumer::new(recorder(&log, "gone"))).unwrap();

        assert!(channel.remove_consumer(id));
        assert!(!channel.remove_consumer(id));
        channel.publish(1).unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_subscription_removes_on_drop() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        let log = Arc::new(Mutex::new(Vec::new()));

        let subscription = channel.subscribe(Consumer::new(recorder(&log, "sub"))).unwrap();
        channel.publish(1).unwrap();
        drop(subscription);
        channel.publish(2).unwrap();
        assert_eq!(*log.lock(), vec!["sub"]);

        let kept = channel.subscribe(Consumer::new(recorder(&log, "kept"))).unwrap();
        let id = kept.detach();
        channel.publish(3).unwrap();
        assert_eq!(*log.lock(), vec!["sub", "kept"]);
        assert!(channel.remove_consumer(id));
    }

    #[test]
    fn test_groups_by_executor() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        channel.add_consumer(Consumer::new(|_: &i32| {})).unwrap();
        channel.add_consumer(Consumer::new(|_: &i32| {}).priority(4)).unwrap();
        channel
            .add_consumer(Consumer::new(|_: &i32| {}).policy(DispatchPolicy::Deferred))
            .unwrap();

        assert_eq!(channel.consumer_count(), 3);
        assert_eq!(channel.executor_count(), 2);
    }

    #[test]
    fn test_unknown_named_policy_is_rejected() {
        let cleaner = manual();
        let channel = channel::<i32>(&cleaner);
        let result =
            channel.add_consumer(Consumer::new(|_: &i32| {}).policy(DispatchPolicy::named("ui")));
        assert!(matches!(result, Err(EventError::UnknownPolicy(_))));
        assert_eq!(channel.consumer_count(), 0);
    }
}

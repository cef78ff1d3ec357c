//! The event service: a directory of channels plus the shared dispatch setup.
//!
//! An [`EventService`] maps every registered [`ChannelKey`] to exactly one
//! [`Channel`]. Registration is idempotent, lookups of unregistered keys
//! fail, and every channel created by one service shares its exception
//! handler, return handlers, executors and cleaner.
//!
//! Types that consume events describe their consumers once by implementing
//! [`EventConsumer`]; [`EventService::register_consumers`] then installs them
//! for one instance, held weakly.
//!
//! # Example
//!
//! ```
//! use herald_events::{Consumes, EventConsumer, EventService, Registrar};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! #[derive(Default)]
//! struct Counter {
//!     ticks: AtomicU32,
//! }
//!
//! impl EventConsumer for Counter {
//!     fn consumers(registrar: &mut Registrar<Self>) {
//!         registrar.consume(
//!             Consumes::new(|counter: &Counter, _: &u64| {
//!                 counter.ticks.fetch_add(1, Ordering::SeqCst);
//!             })
//!             .topic("clock"),
//!         );
//!     }
//! }
//!
//! # fn main() -> herald_events::Result<()> {
//! let service = EventService::new()?;
//! let clock = service.register_channel::<u64>(Some("clock"));
//!
//! let counter = Arc::new(Counter::default());
//! service.register_consumers(&counter)?;
//!
//! clock.publish(1)?;
//! clock.publish(2)?;
//! assert_eq!(counter.ticks.load(Ordering::SeqCst), 2);
//! # Ok(())
//! # }
//! ```

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::channel::{AnyChannel, Channel};
use crate::cleaner::{Cleaner, CleanupPolicy};
use crate::consumer::{Consumer, ConsumerId, DynamicEvent, FilterFn, HandlerFn, TypeGate};
use crate::dispatch::DispatchContext;
use crate::error::{BoxError, ConsumerError, EventError, Result};
use crate::executor::{DispatchPolicy, Executor, ExecutorRegistry};
use crate::handler::{
    ConsumerExceptionHandler, ConsumerReturnHandler, LoggingExceptionHandler, ReturnHandlers,
    ReturnValue,
};
use crate::key::ChannelKey;
use crate::logging::targets;
use crate::threadpool::ThreadPoolConfig;
use crate::worker::WorkerConfig;

/// Startup configuration for an [`EventService`].
#[derive(Debug, Clone, Default)]
pub struct EventServiceConfig {
    /// How stale consumers are collected.
    pub cleanup: CleanupPolicy,
    /// The pool behind [`DispatchPolicy::Background`].
    pub pool: ThreadPoolConfig,
    /// The worker behind [`DispatchPolicy::Dedicated`].
    pub worker: WorkerConfig,
}

/// Builder for [`EventService`].
pub struct EventServiceBuilder {
    config: EventServiceConfig,
    exception_handler: Arc<dyn ConsumerExceptionHandler>,
    return_handlers: ReturnHandlers,
    executors: HashMap<Arc<str>, Arc<dyn Executor>>,
}

impl EventServiceBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: EventServiceConfig::default(),
            exception_handler: Arc::new(LoggingExceptionHandler),
            return_handlers: ReturnHandlers::new(),
            executors: HashMap::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EventServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how stale consumers are collected.
    pub fn cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.config.cleanup = policy;
        self
    }

    /// Install the strategy told about every consumer failure.
    ///
    /// Defaults to [`LoggingExceptionHandler`].
    pub fn exception_handler(mut self, handler: impl ConsumerExceptionHandler + 'static) -> Self {
        self.exception_handler = Arc::new(handler);
        self
    }

    /// Route consumer results of exactly type `R` to `handler`.
    pub fn return_handler<R, H>(mut self, handler: H) -> Self
    where
        R: Any + Send,
        H: ConsumerReturnHandler<R> + 'static,
    {
        self.return_handlers.insert::<R, H>(handler);
        self
    }

    /// Bind an executor to a policy name for [`DispatchPolicy::Named`].
    ///
    /// A later binding under the same name replaces the earlier one.
    pub fn bind_executor(
        mut self,
        name: impl Into<Arc<str>>,
        executor: impl Executor + 'static,
    ) -> Self {
        self.executors.insert(name.into(), Arc::new(executor));
        self
    }

    /// Build the service, starting the cleaner thread if configured.
    pub fn build(self) -> Result<EventService> {
        let cleaner = Cleaner::new(self.config.cleanup)?;
        let executors = ExecutorRegistry::new(self.config.pool, self.config.worker, self.executors);
        tracing::debug!(
            target: targets::CORE,
            return_handlers = self.return_handlers.len(),
            ?executors,
            "event service started"
        );
        Ok(EventService {
            channels: RwLock::new(HashMap::new()),
            exception_handler: self.exception_handler,
            return_handlers: Arc::new(self.return_handlers),
            executors: Arc::new(executors),
            cleaner,
        })
    }
}

impl Default for EventServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventServiceBuilder")
            .field("config", &self.config)
            .field("return_handlers", &self.return_handlers)
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// One registered channel, stored both typed and erased.
struct ChannelEntry {
    typed: Box<dyn Any + Send + Sync>,
    erased: Arc<dyn AnyChannel>,
}

/// Directory of event channels.
pub struct EventService {
    channels: RwLock<HashMap<ChannelKey, ChannelEntry>>,
    exception_handler: Arc<dyn ConsumerExceptionHandler>,
    return_handlers: Arc<ReturnHandlers>,
    executors: Arc<ExecutorRegistry>,
    cleaner: Cleaner,
}

impl EventService {
    /// Create a service with default settings.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Start configuring a service.
    pub fn builder() -> EventServiceBuilder {
        EventServiceBuilder::new()
    }

    /// Register the channel for `T` on `topic`, returning it.
    ///
    /// Idempotent: every call for the same key returns the same channel.
    /// `None` and `Some("")` are the same topic.
    pub fn register_channel<T: Send + Sync + 'static>(&self, topic: Option<&str>) -> Channel<T> {
        let key = ChannelKey::of::<T>(topic);
        if let Some(channel) = self.lookup::<T>(&key) {
            return channel;
        }

        let mut channels = self.channels.write();
        if let Some(channel) = channels.get(&key).and_then(|entry| typed::<T>(entry)) {
            return channel;
        }

        let context = Arc::new(DispatchContext {
            key: key.clone(),
            exception_handler: self.exception_handler.clone(),
            return_handlers: self.return_handlers.clone(),
        });
        let channel = Channel::<T>::new(
            key.clone(),
            context,
            self.executors.clone(),
            self.cleaner.handle(),
        );
        self.cleaner.add_cleanable(channel.cleanable());
        channels.insert(
            key.clone(),
            ChannelEntry {
                typed: Box::new(channel.clone()),
                erased: channel.erased(),
            },
        );
        tracing::debug!(target: targets::SERVICE, channel = %key, "channel registered");
        channel
    }

    /// Look up a registered channel.
    ///
    /// Fails with [`EventError::UnknownChannel`] if the key was never
    /// registered.
    pub fn get_channel<T: Send + Sync + 'static>(&self, topic: Option<&str>) -> Result<Channel<T>> {
        let key = ChannelKey::of::<T>(topic);
        self.lookup::<T>(&key)
            .ok_or_else(|| EventError::unknown_channel(key.type_name(), key.topic()))
    }

    /// Returns `true` if the channel for `T` on `topic` is registered.
    pub fn is_registered<T: 'static>(&self, topic: Option<&str>) -> bool {
        self.channels.read().contains_key(&ChannelKey::of::<T>(topic))
    }

    /// Keys of every registered channel, in no particular order.
    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        self.channels.read().keys().cloned().collect()
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Install every consumer `C` declares, bound to `instance`.
    ///
    /// The service holds `instance` weakly: once it is dropped its consumers
    /// stop receiving events and are cleaned up. Either every declared
    /// consumer is installed or none is.
    pub fn register_consumers<C: EventConsumer>(
        &self,
        instance: &Arc<C>,
    ) -> Result<Vec<ConsumerRef>> {
        let mut registrar = Registrar::new();
        C::consumers(&mut registrar);

        for declaration in &registrar.declarations {
            let key = declaration.key();
            if !self.channels.read().contains_key(&key) {
                return Err(EventError::unknown_channel(key.type_name(), key.topic()));
            }
            self.executors.check(declaration.policy())?;
        }

        let mut installed = Vec::with_capacity(registrar.declarations.len());
        for declaration in registrar.declarations {
            match declaration.install(self, instance) {
                Ok(consumer) => installed.push(consumer),
                Err(err) => {
                    for consumer in &installed {
                        self.unregister(consumer);
                    }
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            target: targets::SERVICE,
            consumer_type = type_name::<C>(),
            consumers = installed.len(),
            "consumers registered"
        );
        Ok(installed)
    }

    /// Remove one installed consumer. Returns `false` if it was already gone.
    pub fn unregister(&self, consumer: &ConsumerRef) -> bool {
        let channel = self
            .channels
            .read()
            .get(&consumer.key)
            .map(|entry| entry.erased.clone());
        channel.is_some_and(|channel| channel.remove_consumer(consumer.id))
    }

    /// Total number of consumers over every channel.
    pub fn consumer_count(&self) -> usize {
        let channels: Vec<_> = self
            .channels
            .read()
            .values()
            .map(|entry| entry.erased.clone())
            .collect();
        channels.iter().map(|channel| channel.consumer_count()).sum()
    }

    /// The cleaner collecting stale consumers for this service's channels.
    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    /// The return handlers shared by this service's channels.
    pub fn return_handlers(&self) -> &ReturnHandlers {
        &self.return_handlers
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &ChannelKey) -> Option<Channel<T>> {
        self.channels.read().get(key).and_then(|entry| typed::<T>(entry))
    }
}

fn typed<T: Send + Sync + 'static>(entry: &ChannelEntry) -> Option<Channel<T>> {
    entry.typed.downcast_ref::<Channel<T>>().cloned()
}

impl fmt::Debug for EventService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventService")
            .field("channels", &self.channel_keys())
            .field("return_handlers", &self.return_handlers)
            .field("executors", &self.executors)
            .field("cleaner", &self.cleaner)
            .finish_non_exhaustive()
    }
}

/// One consumer installed by [`EventService::register_consumers`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerRef {
    key: ChannelKey,
    id: ConsumerId,
}

impl ConsumerRef {
    /// The channel the consumer listens on.
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// The consumer's id within that channel.
    pub fn id(&self) -> ConsumerId {
        self.id
    }
}

/// A type whose instances consume events.
///
/// Implementations declare every consumer once, for the type; the service
/// binds them to a concrete instance at registration.
pub trait EventConsumer: Any + Send + Sync + Sized {
    /// Declare this type's consumers.
    fn consumers(registrar: &mut Registrar<Self>);
}

/// Collects the consumer declarations of one [`EventConsumer`] type.
pub struct Registrar<C> {
    declarations: Vec<Box<dyn Declaration<C>>>,
}

impl<C: EventConsumer> Registrar<C> {
    fn new() -> Self {
        Self {
            declarations: Vec::new(),
        }
    }

    /// Declare one consumer.
    pub fn consume<T: Send + Sync + 'static>(&mut self, consumes: Consumes<C, T>) -> &mut Self {
        self.declarations.push(Box::new(consumes));
        self
    }

    /// Number of consumers declared so far.
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Returns `true` if nothing was declared.
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

impl<C> fmt::Debug for Registrar<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("declarations", &self.declarations.len())
            .finish()
    }
}

type BoundHandler<C, T> =
    Arc<dyn Fn(&C, &T) -> std::result::Result<Option<ReturnValue>, ConsumerError> + Send + Sync>;
type BoundFilter<C, T> =
    Arc<dyn Fn(&C, &T) -> std::result::Result<bool, ConsumerError> + Send + Sync>;

/// Declaration of a consumer of `T` events implemented by `C`.
///
/// The instance-level counterpart of [`Consumer`].
pub struct Consumes<C, T> {
    topic: Option<String>,
    name: Option<Arc<str>>,
    priority: i32,
    policy: DispatchPolicy,
    accepts: Option<TypeGate<T>>,
    filter: Option<BoundFilter<C, T>>,
    handler: BoundHandler<C, T>,
}

impl<C: EventConsumer, T: Send + Sync + 'static> Consumes<C, T> {
    /// Declare a consumer from a handler method.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&C, &T) + Send + Sync + 'static,
    {
        Self::from_handler(Arc::new(move |instance: &C, event: &T| {
            handler(instance, event);
            Ok(None)
        }))
    }

    /// Declare a consumer whose handler can fail.
    pub fn fallible<F, E>(handler: F) -> Self
    where
        F: Fn(&C, &T) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_handler(Arc::new(move |instance: &C, event: &T| {
            handler(instance, event)
                .map(|()| None)
                .map_err(|err| ConsumerError::Failed(err.into()))
        }))
    }

    /// Declare a consumer producing results for a return handler.
    pub fn returning<F, R>(handler: F) -> Self
    where
        F: Fn(&C, &T) -> Option<R> + Send + Sync + 'static,
        R: Any + Send,
    {
        Self::from_handler(Arc::new(move |instance: &C, event: &T| {
            Ok(handler(instance, event).map(ReturnValue::new))
        }))
    }

    fn from_handler(handler: BoundHandler<C, T>) -> Self {
        Self {
            topic: None,
            name: None,
            priority: 0,
            policy: DispatchPolicy::Immediate,
            accepts: None,
            filter: None,
            handler,
        }
    }

    /// Listen on `topic` instead of the "no topic" channel.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Name reported to the exception handler. Defaults to the type name
    /// of `C`.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Dispatch priority; lower runs first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Executor the handler runs on.
    pub fn policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Only invoke the handler for events the filter method accepts.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&C, &T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(move |instance: &C, event: &T| {
            Ok(filter(instance, event))
        }));
        self
    }

    /// Like [`filter`](Self::filter), for a filter method that can fail.
    ///
    /// A failure is reported to the exception handler and the event is
    /// skipped for this consumer.
    pub fn try_filter<F, E>(mut self, filter: F) -> Self
    where
        F: Fn(&C, &T) -> std::result::Result<bool, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.filter = Some(Arc::new(move |instance: &C, event: &T| {
            filter(instance, event).map_err(|err| ConsumerError::Failed(err.into()))
        }));
        self
    }

    fn into_consumer(self, instance: &Arc<C>) -> Consumer<T> {
        let weak = Arc::downgrade(instance);
        let handler = self.handler;
        let bound = weak.clone();
        let handler: HandlerFn<T> = Arc::new(move |event: &T| match bound.upgrade() {
            Some(instance) => handler(&instance, event),
            None => Ok(None),
        });

        let name = self.name.unwrap_or_else(|| Arc::from(type_name::<C>()));
        let mut consumer = Consumer::from_handler(&name, handler)
            .priority(self.priority)
            .policy(self.policy);
        if let Some(accepts) = self.accepts {
            consumer = consumer.with_type_gate(accepts);
        }
        if let Some(filter) = self.filter {
            let bound = weak.clone();
            let filter: FilterFn<T> = Arc::new(move |event: &T| match bound.upgrade() {
                Some(instance) => filter(&instance, event),
                None => Ok(false),
            });
            consumer = consumer.with_filter(filter);
        }
        let owner: Weak<dyn Any + Send + Sync> = weak;
        consumer.with_owner(owner)
    }
}

impl<C: EventConsumer, T: DynamicEvent> Consumes<C, T> {
    /// Declare a consumer for payloads of runtime type `U` only.
    ///
    /// Events carrying any other payload are skipped before the filter runs.
    pub fn narrowed<U, F>(handler: F) -> Self
    where
        U: Any,
        F: Fn(&C, &U) + Send + Sync + 'static,
    {
        let mut consumes = Self::from_handler(Arc::new(move |instance: &C, event: &T| {
            if let Some(payload) = event.as_any_event().downcast_ref::<U>() {
                handler(instance, payload);
            }
            Ok(None)
        }));
        consumes.accepts = Some(Arc::new(|event: &T| event.as_any_event().is::<U>()));
        consumes
    }

    /// Filter on a payload of runtime type `U`; other payloads are rejected.
    pub fn filter_narrowed<U, F>(self, filter: F) -> Self
    where
        U: Any,
        F: Fn(&C, &U) -> bool + Send + Sync + 'static,
    {
        self.filter(move |instance: &C, event: &T| {
            event
                .as_any_event()
                .downcast_ref::<U>()
                .is_some_and(|payload| filter(instance, payload))
        })
    }
}

impl<C, T> fmt::Debug for Consumes<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumes")
            .field("topic", &self.topic)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("policy", &self.policy)
            .field("narrowed", &self.accepts.is_some())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// A declaration with its event type erased.
trait Declaration<C>: Send + Sync {
    fn key(&self) -> ChannelKey;
    fn policy(&self) -> &DispatchPolicy;
    fn install(self: Box<Self>, service: &EventService, instance: &Arc<C>) -> Result<ConsumerRef>;
}

impl<C: EventConsumer, T: Send + Sync + 'static> Declaration<C> for Consumes<C, T> {
    fn key(&self) -> ChannelKey {
        ChannelKey::of::<T>(self.topic.as_deref())
    }

    fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    fn install(self: Box<Self>, service: &EventService, instance: &Arc<C>) -> Result<ConsumerRef> {
        let channel = service.get_channel::<T>(self.topic.as_deref())?;
        let id = channel.add_consumer(self.into_consumer(instance))?;
        Ok(ConsumerRef {
            key: channel.key().clone(),
            id,
        })
    }
}

//! Consumer declarations and the bindings a channel keeps for them.
//!
//! A [`Consumer`] is built by the caller and handed to
//! [`Channel::add_consumer`](crate::Channel::add_consumer) or
//! [`Channel::subscribe`](crate::Channel::subscribe). The channel turns it
//! into a binding ordered by `(priority, registration sequence)`: lower
//! priorities run first and equal priorities run in registration order.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{BoxError, ConsumerError};
use crate::executor::DispatchPolicy;
use crate::handler::ReturnValue;

pub(crate) type HandlerFn<T> =
    Arc<dyn Fn(&T) -> Result<Option<ReturnValue>, ConsumerError> + Send + Sync>;
pub(crate) type FilterFn<T> = Arc<dyn Fn(&T) -> Result<bool, ConsumerError> + Send + Sync>;
pub(crate) type TypeGate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Identifies one consumer binding within its channel.
///
/// Ids are the channel's registration sequence numbers, so they are unique
/// per channel and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(pub(crate) u64);

impl ConsumerId {
    /// The registration sequence number behind this id.
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// Total dispatch order of a binding: priority first, then registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ConsumerOrder {
    pub(crate) priority: i32,
    pub(crate) sequence: u64,
}

impl ConsumerOrder {
    pub(crate) fn id(&self) -> ConsumerId {
        ConsumerId(self.sequence)
    }
}

/// Event types carrying a runtime-typed payload.
///
/// Channels of these types accept consumers declared for a narrower type
/// with [`Consumer::narrowed`]; such consumers only see events whose runtime
/// type matches exactly.
pub trait DynamicEvent: Send + Sync + 'static {
    /// The payload, for downcasting.
    fn as_any_event(&self) -> &dyn Any;
}

impl DynamicEvent for Arc<dyn Any + Send + Sync> {
    fn as_any_event(&self) -> &dyn Any {
        &**self
    }
}

impl DynamicEvent for Box<dyn Any + Send + Sync> {
    fn as_any_event(&self) -> &dyn Any {
        &**self
    }
}

/// A consumer declaration, ready to be added to a channel.
///
/// # Example
///
/// ```
/// use herald_events::{Consumer, DispatchPolicy};
///
/// let consumer = Consumer::new(|value: &i32| println!("got {value}"))
///     .named("printer")
///     .priority(-1)
///     .filter(|value| *value > 10)
///     .policy(DispatchPolicy::Immediate);
/// # drop(consumer);
/// ```
pub struct Consumer<T> {
    name: Arc<str>,
    priority: i32,
    policy: DispatchPolicy,
    owner: Option<Weak<dyn Any + Send + Sync>>,
    accepts: Option<TypeGate<T>>,
    filter: Option<FilterFn<T>>,
    handler: HandlerFn<T>,
}

impl<T: 'static> Consumer<T> {
    /// Declare a consumer from a plain handler.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self::from_handler(
            type_name::<F>(),
            Arc::new(move |event: &T| {
                handler(event);
                Ok(None)
            }),
        )
    }

    /// Declare a consumer whose handler can fail.
    ///
    /// Errors are reported to the exception handler like panics are.
    pub fn fallible<F, E>(handler: F) -> Self
    where
        F: Fn(&T) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_handler(
            type_name::<F>(),
            Arc::new(move |event: &T| {
                handler(event)
                    .map(|()| None)
                    .map_err(|err| ConsumerError::Failed(err.into()))
            }),
        )
    }

    /// Declare a consumer producing a result.
    ///
    /// `Some(result)` is passed to the return handler bound for exactly `R`,
    /// if any; `None` means there is nothing to hand on.
    pub fn returning<F, R>(handler: F) -> Self
    where
        F: Fn(&T) -> Option<R> + Send + Sync + 'static,
        R: Any + Send,
    {
        Self::from_handler(
            type_name::<F>(),
            Arc::new(move |event: &T| Ok(handler(event).map(ReturnValue::new))),
        )
    }

    pub(crate) fn from_handler(name: &str, handler: HandlerFn<T>) -> Self {
        Self {
            name: Arc::from(name),
            priority: 0,
            policy: DispatchPolicy::Immediate,
            owner: None,
            accepts: None,
            filter: None,
            handler,
        }
    }

    /// Name reported to the exception handler. Defaults to the handler's
    /// type name.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Dispatch priority; lower runs first. Defaults to `0`.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Executor this consumer runs on. Defaults to
    /// [`DispatchPolicy::Immediate`].
    pub fn policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Only invoke the handler for events the predicate accepts.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(move |event: &T| Ok(filter(event))));
        self
    }

    /// Like [`filter`](Self::filter), for predicates that can fail.
    ///
    /// A failing filter is reported and the consumer is skipped.
    pub fn try_filter<F, E>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> Result<bool, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.filter = Some(Arc::new(move |event: &T| {
            filter(event).map_err(|err| ConsumerError::Failed(err.into()))
        }));
        self
    }

    /// Tie this consumer's lifetime to `owner`.
    ///
    /// Only a weak reference is kept. Once every strong reference to the
    /// owner is gone the binding is never dispatched again and is removed
    /// by the next cleanup pass.
    pub fn owned_by<O>(mut self, owner: &Arc<O>) -> Self
    where
        O: Any + Send + Sync,
    {
        let weak = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        self.owner = Some(weak);
        self
    }

    pub(crate) fn with_owner(mut self, owner: Weak<dyn Any + Send + Sync>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub(crate) fn with_filter(mut self, filter: FilterFn<T>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub(crate) fn with_type_gate(mut self, accepts: TypeGate<T>) -> Self {
        self.accepts = Some(accepts);
        self
    }

    pub(crate) fn dispatch_policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub(crate) fn into_binding(self, sequence: u64) -> ConsumerBinding<T> {
        ConsumerBinding {
            order: ConsumerOrder {
                priority: self.priority,
                sequence,
            },
            name: self.name,
            owner: self.owner,
            accepts: self.accepts,
            filter: self.filter,
            handler: self.handler,
        }
    }
}

impl<T: DynamicEvent> Consumer<T> {
    /// Declare a consumer for payloads of runtime type `U` only.
    ///
    /// Events carrying any other payload type are skipped without invoking
    /// the handler or the filter.
    pub fn narrowed<U, F>(handler: F) -> Self
    where
        U: Any,
        F: Fn(&U) + Send + Sync + 'static,
    {
        Self::from_handler(
            type_name::<F>(),
            Arc::new(move |event: &T| {
                if let Some(payload) = event.as_any_event().downcast_ref::<U>() {
                    handler(payload);
                }
                Ok(None)
            }),
        )
        .with_type_gate(Arc::new(|event: &T| event.as_any_event().is::<U>()))
    }

    /// Filter on a payload of runtime type `U`; other payloads are rejected.
    pub fn filter_narrowed<U, F>(self, filter: F) -> Self
    where
        U: Any,
        F: Fn(&U) -> bool + Send + Sync + 'static,
    {
        self.filter(move |event: &T| {
            event
                .as_any_event()
                .downcast_ref::<U>()
                .is_some_and(|payload| filter(payload))
        })
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("policy", &self.policy)
            .field("owned", &self.owner.is_some())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Whether a binding's owner can still receive events.
pub(crate) enum Liveness {
    /// Registered without an owner; lives until removed.
    Unowned,
    /// The owner is alive; the strong reference pins it for this dispatch.
    Alive(Arc<dyn Any + Send + Sync>),
    /// The owner is gone.
    Stale,
}

/// A registered consumer as stored by a channel.
pub(crate) struct ConsumerBinding<T> {
    order: ConsumerOrder,
    name: Arc<str>,
    owner: Option<Weak<dyn Any + Send + Sync>>,
    accepts: Option<TypeGate<T>>,
    filter: Option<FilterFn<T>>,
    handler: HandlerFn<T>,
}

impl<T> ConsumerBinding<T> {
    pub(crate) fn order(&self) -> ConsumerOrder {
        self.order
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn liveness(&self) -> Liveness {
        match &self.owner {
            None => Liveness::Unowned,
            Some(weak) => match weak.upgrade() {
                Some(owner) => Liveness::Alive(owner),
                None => Liveness::Stale,
            },
        }
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|weak| weak.strong_count() == 0)
    }

    /// Runtime type check; always `true` unless declared with a narrower type.
    pub(crate) fn accepts(&self, event: &T) -> bool {
        self.accepts.as_ref().is_none_or(|accepts| accepts(event))
    }

    pub(crate) fn filter(&self, event: &T) -> Result<bool, ConsumerError> {
        match &self.filter {
            Some(filter) => filter(event),
            None => Ok(true),
        }
    }

    pub(crate) fn invoke(&self, event: &T) -> Result<Option<ReturnValue>, ConsumerError> {
        (self.handler)(event)
    }
}

//! Pluggable strategies invoked during dispatch.
//!
//! - [`ConsumerExceptionHandler`] - told about every failing filter, consumer
//!   or return handler, on the thread that ran it
//! - [`ConsumerReturnHandler`] - receives non-empty consumer results of one
//!   exact type
//!
//! Both are installed on the [`EventService`](crate::EventService) at build
//! time and shared by every channel it creates.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::dispatch::guarded;
use crate::error::{BoxError, ConsumerError};
use crate::key::ChannelKey;
use crate::logging::targets;

/// Which step of a dispatch raised a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    /// The consumer's filter predicate.
    Filter,
    /// The consumer's handler.
    Consumer,
    /// The return handler that received the consumer's result.
    ReturnHandler,
    /// Handing the consumer's batch to its executor.
    Submit,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Filter => "filter",
            Self::Consumer => "consumer",
            Self::ReturnHandler => "return handler",
            Self::Submit => "submit",
        })
    }
}

/// What dispatch should do after a failure has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureAction {
    /// Carry on with the next consumer.
    #[default]
    Continue,
    /// Abort the current dispatch call and report
    /// [`EventError::Escalated`](crate::EventError::Escalated).
    ///
    /// For a batch this stops the remaining consumers of that batch only;
    /// batches handed to other executors are unaffected. For a filter, the
    /// publish call returns the error before any batch is submitted. For a
    /// refused batch, the publish call returns the error once every other
    /// batch has been submitted.
    Escalate,
}

/// Everything known about a single consumer failure.
#[derive(Debug)]
pub struct ConsumerFailure<'a> {
    /// The failure itself.
    pub error: &'a ConsumerError,
    /// Name of the consumer whose filter, handler or result failed.
    pub consumer: &'a str,
    /// The consumer's owner, if it was registered with one.
    pub owner: Option<&'a (dyn Any + Send + Sync)>,
    /// Where in the dispatch the failure happened.
    pub stage: FailureStage,
    /// The channel being dispatched.
    pub channel: &'a ChannelKey,
}

impl ConsumerFailure<'_> {
    /// Name of the event type being dispatched.
    pub fn event_type(&self) -> &'static str {
        self.channel.type_name()
    }

    /// Topic of the channel being dispatched.
    pub fn topic(&self) -> Option<&str> {
        self.channel.topic()
    }

    /// Downcast the owner to a concrete type.
    pub fn owner_as<O: Any>(&self) -> Option<&O> {
        self.owner.and_then(|owner| owner.downcast_ref::<O>())
    }
}

/// Strategy notified of every failure raised while dispatching an event.
///
/// Called synchronously on the thread running the failing callable, so a
/// consumer on a background executor reports from that background thread.
/// Returning [`FailureAction::Continue`] isolates the failure completely.
///
/// Closures of the right shape implement this trait:
///
/// ```
/// use herald_events::{ConsumerFailure, FailureAction};
///
/// let handler = |failure: &ConsumerFailure<'_>| {
///     eprintln!("{} failed: {}", failure.consumer, failure.error);
///     FailureAction::Continue
/// };
/// # let _: &dyn herald_events::ConsumerExceptionHandler = &handler;
/// ```
pub trait ConsumerExceptionHandler: Send + Sync {
    /// Handle one failure and decide whether dispatch carries on.
    fn handle_exception(&self, failure: &ConsumerFailure<'_>) -> FailureAction;
}

impl<F> ConsumerExceptionHandler for F
where
    F: Fn(&ConsumerFailure<'_>) -> FailureAction + Send + Sync,
{
    fn handle_exception(&self, failure: &ConsumerFailure<'_>) -> FailureAction {
        self(failure)
    }
}

/// Default strategy: log the failure and continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExceptionHandler;

impl ConsumerExceptionHandler for LoggingExceptionHandler {
    fn handle_exception(&self, failure: &ConsumerFailure<'_>) -> FailureAction {
        tracing::error!(
            target: targets::CHANNEL,
            consumer = failure.consumer,
            event_type = failure.event_type(),
            topic = failure.topic().unwrap_or(""),
            stage = %failure.stage,
            error = %failure.error,
            "event consumer failed"
        );
        FailureAction::Continue
    }
}

/// Strategy that logs the failure and then escalates it.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscalatingExceptionHandler;

impl ConsumerExceptionHandler for EscalatingExceptionHandler {
    fn handle_exception(&self, failure: &ConsumerFailure<'_>) -> FailureAction {
        LoggingExceptionHandler.handle_exception(failure);
        FailureAction::Escalate
    }
}

/// Receives results of type `R` returned by consumers.
///
/// Runs on the same thread as the consumer that produced the result.
/// Matching is exact: a handler for `String` never sees a `&'static str`.
pub trait ConsumerReturnHandler<R>: Send + Sync {
    /// Process one consumer result.
    fn handle(&self, result: R) -> Result<(), BoxError>;
}

impl<R, F> ConsumerReturnHandler<R> for F
where
    F: Fn(R) -> Result<(), BoxError> + Send + Sync,
{
    fn handle(&self, result: R) -> Result<(), BoxError> {
        self(result)
    }
}

/// A type-erased, non-empty consumer result.
pub(crate) struct ReturnValue {
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl ReturnValue {
    pub(crate) fn new<R: Any + Send>(value: R) -> Self {
        Self {
            type_id: TypeId::of::<R>(),
            type_name: std::any::type_name::<R>(),
            value: Box::new(value),
        }
    }
}

trait ErasedReturnHandler: Send + Sync {
    fn handle_any(&self, value: Box<dyn Any + Send>) -> Result<(), BoxError>;
}

struct TypedReturnHandler<R, H> {
    handler: H,
    _result: PhantomData<fn(R)>,
}

impl<R, H> ErasedReturnHandler for TypedReturnHandler<R, H>
where
    R: Any + Send,
    H: ConsumerReturnHandler<R>,
{
    fn handle_any(&self, value: Box<dyn Any + Send>) -> Result<(), BoxError> {
        match value.downcast::<R>() {
            Ok(result) => self.handler.handle(*result),
            Err(_) => Err(format!(
                "return value is not a {}",
                std::any::type_name::<R>()
            )
            .into()),
        }
    }
}

/// Return handlers keyed by the exact result type they accept.
#[derive(Clone, Default)]
pub struct ReturnHandlers {
    handlers: HashMap<TypeId, Arc<dyn ErasedReturnHandler>>,
}

impl ReturnHandlers {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to results of type `R`, replacing any previous binding.
    pub fn insert<R, H>(&mut self, handler: H)
    where
        R: Any + Send,
        H: ConsumerReturnHandler<R> + 'static,
    {
        self.handlers.insert(
            TypeId::of::<R>(),
            Arc::new(TypedReturnHandler {
                handler,
                _result: PhantomData,
            }),
        );
    }

    /// Returns `true` if a handler is bound for `R`.
    pub fn contains<R: Any>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<R>())
    }

    /// Number of bound handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is bound.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route a result to its handler.
    ///
    /// Returns `None` when no handler is bound for the result's type; the
    /// result is then dropped.
    pub(crate) fn dispatch(&self, value: ReturnValue) -> Option<Result<(), ConsumerError>> {
        let Some(handler) = self.handlers.get(&value.type_id) else {
            tracing::trace!(
                target: targets::CHANNEL,
                result_type = value.type_name,
                "no return handler bound, dropping consumer result"
            );
            return None;
        };
        let boxed = value.value;
        Some(guarded(|| handler.handle_any(boxed).map_err(ConsumerError::Failed)))
    }
}

impl fmt::Debug for ReturnHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnHandlers")
            .field("len", &self.handlers.len())
            .finish()
    }
}

//! Dispatch batches: one unit of work per executor per publish.
//!
//! When a channel publishes, it groups interested consumers by executor and
//! builds one [`DispatchTask`] per non-empty group. Each task invokes its
//! consumers in order on whatever thread the executor chooses; every
//! invocation is isolated, so a failing consumer is reported to the
//! exception handler and the next one still runs.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::consumer::ConsumerBinding;
use crate::error::{ConsumerError, EventError, Result};
use crate::handler::{
    ConsumerExceptionHandler, ConsumerFailure, FailureAction, FailureStage, ReturnHandlers,
};
use crate::key::ChannelKey;
use crate::logging::{span_names, targets};

/// Run a user callable, turning a panic into [`ConsumerError::Panicked`].
pub(crate) fn guarded<R>(
    f: impl FnOnce() -> std::result::Result<R, ConsumerError>,
) -> std::result::Result<R, ConsumerError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ConsumerError::from_panic(payload)),
    }
}

/// State shared by every batch a channel builds.
pub(crate) struct DispatchContext {
    pub(crate) key: ChannelKey,
    pub(crate) exception_handler: Arc<dyn ConsumerExceptionHandler>,
    pub(crate) return_handlers: Arc<ReturnHandlers>,
}

impl DispatchContext {
    /// Report a failure and convert an escalation into an error.
    pub(crate) fn report<T>(
        &self,
        binding: &ConsumerBinding<T>,
        owner: Option<&(dyn Any + Send + Sync)>,
        stage: FailureStage,
        error: ConsumerError,
    ) -> Result<()> {
        let failure = ConsumerFailure {
            error: &error,
            consumer: binding.name(),
            owner,
            stage,
            channel: &self.key,
        };
        // A panicking strategy counts as an escalation rather than unwinding
        // through an executor thread.
        let action = catch_unwind(AssertUnwindSafe(|| {
            self.exception_handler.handle_exception(&failure)
        }))
        .unwrap_or(FailureAction::Escalate);

        match action {
            FailureAction::Continue => Ok(()),
            FailureAction::Escalate => Err(EventError::Escalated {
                consumer: binding.name().to_string(),
                source: error,
            }),
        }
    }
}

/// A consumer selected for one dispatch, with its owner pinned alive.
pub(crate) struct Candidate<T> {
    pub(crate) binding: Arc<ConsumerBinding<T>>,
    pub(crate) owner: Option<Arc<dyn Any + Send + Sync>>,
}

impl<T> Candidate<T> {
    pub(crate) fn owner_ref(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.owner.as_deref()
    }
}

/// The interested consumers of one executor for one published event.
pub(crate) struct DispatchBatch<T> {
    context: Arc<DispatchContext>,
    event: Arc<T>,
    consumers: Vec<Candidate<T>>,
}

impl<T: Send + Sync + 'static> DispatchBatch<T> {
    pub(crate) fn new(context: Arc<DispatchContext>, event: Arc<T>) -> Self {
        Self {
            context,
            event,
            consumers: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, candidate: Candidate<T>) {
        self.consumers.push(candidate);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Invoke every consumer in order.
    ///
    /// Stops early only when the exception handler escalates.
    pub(crate) fn run(&self) -> Result<()> {
        let _span = tracing::trace_span!(
            target: targets::CHANNEL,
            span_names::DISPATCH,
            channel = %self.context.key,
            consumers = self.consumers.len()
        )
        .entered();

        for candidate in &self.consumers {
            self.notify(candidate)?;
        }
        Ok(())
    }

    fn notify(&self, candidate: &Candidate<T>) -> Result<()> {
        let binding = &candidate.binding;
        match guarded(|| binding.invoke(&self.event)) {
            Ok(None) => Ok(()),
            Ok(Some(value)) => match self.context.return_handlers.dispatch(value) {
                None | Some(Ok(())) => Ok(()),
                Some(Err(error)) => self.context.report(
                    binding,
                    candidate.owner_ref(),
                    FailureStage::ReturnHandler,
                    error,
                ),
            },
            Err(error) => {
                self.context
                    .report(binding, candidate.owner_ref(), FailureStage::Consumer, error)
            }
        }
    }

    /// Report every consumer of a batch its executor refused to run.
    ///
    /// Each consumer gets its own [`FailureStage::Submit`] failure; an
    /// escalation stops the reporting and is returned.
    pub(crate) fn report_rejected(&self, executor: &str, reason: &str) -> Result<()> {
        for candidate in &self.consumers {
            let error = ConsumerError::Rejected {
                executor: executor.to_string(),
                reason: reason.to_string(),
            };
            self.context.report(
                &candidate.binding,
                candidate.owner_ref(),
                FailureStage::Submit,
                error,
            )?;
        }
        Ok(())
    }

    /// Wrap this batch into an executor-agnostic task.
    ///
    /// The publisher keeps its own handle so a refused batch can still be
    /// reported.
    pub(crate) fn to_task(self: &Arc<Self>) -> DispatchTask {
        let batch = Arc::clone(self);
        DispatchTask {
            channel: self.context.key.clone(),
            consumers: self.consumers.len(),
            run: Box::new(move || batch.run()),
        }
    }
}

/// One unit of work handed to an [`Executor`](crate::Executor).
///
/// Running it invokes every interested consumer of one executor group in
/// priority order. The result is `Err` only if the exception handler
/// escalated a failure.
pub struct DispatchTask {
    channel: ChannelKey,
    consumers: usize,
    run: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl DispatchTask {
    /// Build a task from an arbitrary closure.
    ///
    /// Mostly useful for testing custom executors.
    pub fn from_fn<F>(channel: ChannelKey, f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            channel,
            consumers: 0,
            run: Box::new(f),
        }
    }

    /// The channel this task dispatches for.
    pub fn channel(&self) -> &ChannelKey {
        &self.channel
    }

    /// Number of consumers this task will invoke.
    pub fn consumer_count(&self) -> usize {
        self.consumers
    }

    /// Run the task on the current thread.
    pub fn run(self) -> Result<()> {
        (self.run)()
    }

    /// Run the task on the current thread, logging an escalated failure
    /// instead of returning it.
    ///
    /// Executors that run tasks away from the publisher use this, since
    /// there is nobody left to return the error to.
    pub fn run_detached(self) {
        let channel = self.channel.clone();
        if let Err(err) = self.run() {
            tracing::error!(
                target: targets::EXECUTOR,
                %channel,
                error = %err,
                "escalated failure in detached dispatch"
            );
        }
    }
}

impl fmt::Debug for DispatchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTask")
            .field("channel", &self.channel)
            .field("consumers", &self.consumers)
            .finish()
    }
}

//! Error types for Herald events.

use std::any::Any;

/// Boxed error returned by fallible consumers, filters and return handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized Result type for Herald event operations.
pub type Result<T> = std::result::Result<T, EventError>;

/// The main error type for Herald event operations.
///
/// Apart from [`EventError::Escalated`], none of these reach a publisher on
/// account of consumer behavior: a failing consumer, or an executor refusing
/// its batch, is reported to the
/// [`ConsumerExceptionHandler`](crate::ConsumerExceptionHandler) and dispatch
/// carries on.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// No channel was registered for this event type and topic.
    #[error(
        "No registered event channel for type '{event_type}' and topic '{}'",
        .topic.as_deref().unwrap_or("")
    )]
    UnknownChannel {
        event_type: &'static str,
        topic: Option<String>,
    },

    /// A consumer asked for a named dispatch policy that has no executor bound.
    #[error("No executor bound for dispatch policy '{0}'")]
    UnknownPolicy(String),

    /// An executor refused to accept a dispatch task.
    #[error("Executor '{executor}' rejected dispatch task: {reason}")]
    ExecutorRejected { executor: String, reason: String },

    /// A built-in executor could not be started.
    #[error("Failed to create executor: {0}")]
    ExecutorCreation(String),

    /// The exception handler chose to escalate a consumer failure.
    #[error("Consumer '{consumer}' failure escalated: {source}")]
    Escalated {
        consumer: String,
        #[source]
        source: ConsumerError,
    },
}

impl EventError {
    /// Create a lookup error for an unregistered channel.
    pub fn unknown_channel(event_type: &'static str, topic: Option<&str>) -> Self {
        Self::UnknownChannel {
            event_type,
            topic: topic.map(str::to_owned),
        }
    }

    /// Create a rejection error for the named executor.
    pub fn rejected(executor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutorRejected {
            executor: executor.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if this is a channel lookup error.
    pub fn is_unknown_channel(&self) -> bool {
        matches!(self, Self::UnknownChannel { .. })
    }
}

/// A failure raised by one consumer, filter or return handler during dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The callable returned an error.
    #[error("{0}")]
    Failed(#[source] BoxError),

    /// The callable panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The consumer's executor refused the batch it belonged to.
    #[error("rejected by executor '{executor}': {reason}")]
    Rejected { executor: String, reason: String },
}

impl ConsumerError {
    /// Wrap any error convertible into a [`BoxError`].
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(err.into())
    }

    /// Build a `Panicked` error from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }

    /// Returns `true` if the failure was a caught panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

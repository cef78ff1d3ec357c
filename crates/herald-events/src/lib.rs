//! Typed event channels for Herald.
//!
//! This crate provides an in-process publish/subscribe mechanism:
//!
//! - **Channels**: one broadcast endpoint per event type and optional topic
//! - **Ordered dispatch**: consumers run by ascending priority, ties in
//!   registration order
//! - **Dispatch policies**: each consumer runs on the executor it declares,
//!   from the publishing thread to a background pool or a dedicated worker
//! - **Failure isolation**: a failing consumer is reported to a pluggable
//!   exception handler and never stops delivery to the others
//! - **Weak cleanup**: consumers tied to an owner disappear once the owner
//!   is dropped
//!
//! # Example
//!
//! ```
//! use herald_events::{Consumer, DispatchPolicy, EventService};
//! use std::sync::{Arc, Mutex};
//!
//! # fn main() -> herald_events::Result<()> {
//! let service = EventService::new()?;
//! let channel = service.register_channel::<String>(Some("greetings"));
//!
//! let log = Arc::new(Mutex::new(Vec::new()));
//! let (first, second) = (log.clone(), log.clone());
//!
//! let _a = channel.subscribe(
//!     Consumer::new(move |msg: &String| first.lock().unwrap().push(format!("a:{msg}")))
//!         .priority(5),
//! )?;
//! let _b = channel.subscribe(
//!     Consumer::new(move |msg: &String| second.lock().unwrap().push(format!("b:{msg}")))
//!         .priority(1)
//!         .policy(DispatchPolicy::Immediate),
//! )?;
//!
//! // Anyone holding the service can find the same channel again.
//! let same = service.get_channel::<String>(Some("greetings"))?;
//! same.publish("hello".to_string())?;
//!
//! assert_eq!(*log.lock().unwrap(), vec!["b:hello", "a:hello"]);
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "tokio")]
pub mod async_runtime;
mod channel;
pub mod cleaner;
mod consumer;
mod dispatch;
mod error;
pub mod executor;
mod handler;
mod key;
pub mod logging;
mod service;
pub mod threadpool;
pub mod worker;

#[cfg(feature = "tokio")]
pub use async_runtime::TokioExecutor;
pub use channel::{Channel, Subscription};
pub use cleaner::{Cleanable, CleanableId, Cleaner, CleanupPolicy};
pub use consumer::{Consumer, ConsumerId, DynamicEvent};
pub use dispatch::DispatchTask;
pub use error::{BoxError, ConsumerError, EventError, Result};
pub use executor::{DeferredThreadExecutor, DispatchPolicy, Executor, ImmediateExecutor};
pub use handler::{
    ConsumerExceptionHandler, ConsumerFailure, ConsumerReturnHandler, EscalatingExceptionHandler,
    FailureAction, FailureStage, LoggingExceptionHandler, ReturnHandlers,
};
pub use key::ChannelKey;
pub use service::{
    ConsumerRef, Consumes, EventConsumer, EventService, EventServiceBuilder, EventServiceConfig,
    Registrar,
};
pub use threadpool::{PoolExecutor, ThreadPoolConfig};
pub use worker::{WorkerBuilder, WorkerConfig, WorkerExecutor};

// Handles are shared freely between publishing threads.
static_assertions::assert_impl_all!(Channel<i32>: Send, Sync, Clone);
static_assertions::assert_impl_all!(EventService: Send, Sync);
static_assertions::assert_impl_all!(Subscription: Send, Sync);
static_assertions::assert_impl_all!(DispatchTask: Send);

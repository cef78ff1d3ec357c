//! Logging facilities for Herald events.
//!
//! Herald uses the `tracing` crate for instrumentation and never installs a
//! subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("herald_events::channel=trace,herald_events=debug")
//!     .init();
//! ```
//!
//! Consumer failures handled by the default
//! [`LoggingExceptionHandler`](crate::LoggingExceptionHandler) are logged at
//! `error` level under [`targets::CHANNEL`].

/// Span names used throughout Herald for tracing.
///
/// These constants can be used to filter traces for specific subsystems.
pub mod span_names {
    /// Event publication span.
    pub const PUBLISH: &str = "herald_events::publish";
    /// Dispatch batch execution span.
    pub const DISPATCH: &str = "herald_events::dispatch";
    /// Stale binding sweep span.
    pub const CLEANUP: &str = "herald_events::cleanup";
}

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Crate-wide target.
    pub const CORE: &str = "herald_events";
    /// Channel registration, publication and dispatch.
    pub const CHANNEL: &str = "herald_events::channel";
    /// Event service directory and consumer registration.
    pub const SERVICE: &str = "herald_events::service";
    /// Background cleaner thread.
    pub const CLEANER: &str = "herald_events::cleaner";
    /// Executor lifecycle.
    pub const EXECUTOR: &str = "herald_events::executor";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_share_crate_prefix() {
        for target in [
            targets::CHANNEL,
            targets::SERVICE,
            targets::CLEANER,
            targets::EXECUTOR,
        ] {
            assert!(target.starts_with(targets::CORE));
        }
        for span in [span_names::PUBLISH, span_names::DISPATCH, span_names::CLEANUP] {
            assert!(span.starts_with(targets::CORE));
        }
    }
}

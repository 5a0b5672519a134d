//! The failsafe envelope: swallows transient storage errors into a
//! caller-supplied default so cache faults never become user-visible
//! failures.

use std::future::Future;
use std::sync::Arc;

use recoverable::{Recover, RecoveryKind};

use crate::error::Error;

/// Receives transient errors the failsafe envelope swallowed.
///
/// Mirrors the cache framework's `error_handler` callback: invoked with
/// the call-site tag, the underlying error, and the default value that
/// was substituted for it. Implementations should not block or panic;
/// this runs inline on the calling task.
pub trait ErrorHandler: Send + Sync {
    /// Called once per swallowed transient error.
    fn handle(&self, tag: &'static str, error: &Error);
}

/// An [`ErrorHandler`] that does nothing, used when no error-handler is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopErrorHandler;

impl ErrorHandler for NoopErrorHandler {
    fn handle(&self, _tag: &'static str, _error: &Error) {}
}

/// Wraps storage calls so that transient failures never surface to a
/// caller. Built once per [`crate::Store`](crate) and shared across
/// every operation.
#[derive(Clone)]
pub struct Failsafe {
    error_handler: Arc<dyn ErrorHandler>,
}

impl std::fmt::Debug for Failsafe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Failsafe").finish_non_exhaustive()
    }
}

impl Default for Failsafe {
    fn default() -> Self {
        Self::noop()
    }
}

impl Failsafe {
    /// Builds a failsafe envelope that reports swallowed errors to
    /// `error_handler`.
    #[must_use]
    pub fn new(error_handler: Arc<dyn ErrorHandler>) -> Self {
        Self { error_handler }
    }

    /// Builds a failsafe envelope with no error-handler; swallowed errors
    /// are only logged.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopErrorHandler))
    }

    /// Runs `f`. If it fails with a transient storage error, logs the
    /// failure, reports it to the configured error-handler, and returns
    /// `Ok(default)`. Any other error propagates as `Err`.
    ///
    /// `tag` identifies the call site (e.g. `"read_entry"`, `"write_entry"`,
    /// `"async"` for background tasks) for the error-handler's benefit.
    pub async fn guard<T, F, Fut>(&self, tag: &'static str, default: T, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match f().await {
            Ok(value) => Ok(value),
            Err(err) => match err.recovery().kind() {
                RecoveryKind::Retry | RecoveryKind::Unavailable => {
                    tracing::warn!(tag, error = %err, "transient storage error swallowed by failsafe");
                    self.error_handler.handle(tag, &err);
                    Ok(default)
                }
                RecoveryKind::Never | RecoveryKind::Unknown => Err(err),
            },
        }
    }
}

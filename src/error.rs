use std::any::Any;
use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reactor.
///
/// Everything that can fail does so either while acquiring operating
/// system resources (`ResourceExhausted`, `AllocationFailed`, `Backend`)
/// or inside user-supplied callback code (`CallbackFailed`). Disconnecting
/// or modifying an established connection never fails.
#[derive(Debug, Error)]
pub enum Error {
    /// A pipe or readiness backend could not be allocated.
    ///
    /// Reported from constructors only.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[source] io::Error),

    /// A registration could not take effect on the readiness backend.
    ///
    /// Reported from `watch`; the connection is rolled back and nothing
    /// is registered.
    #[error("registration failed: {0}")]
    AllocationFailed(#[source] io::Error),

    /// The readiness backend reported a failure while waiting for events.
    ///
    /// Interrupted waits are retried internally and never surface here.
    #[error("backend wait failed: {0}")]
    Backend(#[source] io::Error),

    /// A user callback panicked during dispatch.
    ///
    /// The dispatcher state is restored before this is returned: guards
    /// are released, pending work remains pending and the wake-up flag is
    /// re-raised where another dispatch round is required. Callbacks that
    /// ran before the failing one are not run again.
    #[error("callback panicked: {}", .message.as_deref().unwrap_or("non-string panic payload"))]
    CallbackFailed {
        /// Panic message, when the payload carried one.
        message: Option<String>,
    },
}

impl Error {
    pub(crate) fn callback_failed(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        Error::CallbackFailed { message }
    }
}

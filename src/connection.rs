//! Connection handles.
//!
//! Registering a callback yields a connection: the externally held handle
//! to the internal link record. Handles are cheap to clone (they share
//! the underlying link) and dropping a handle does *not* break the
//! connection; only [`Connection::disconnect`] does. A disconnected link
//! stops receiving events, but reclamation of its owned state follows
//! the service's deferred-cleanup protocol.
//!
//! Every service-specific handle (I/O readiness, timers, async work)
//! can be downcast into the type-erased [`Connection`], losing the
//! service-specific operations but keeping disconnect semantics.

use std::sync::Arc;

/// Internal link record behind every connection.
///
/// The disconnect guarantee is deliberately weak but precise:
/// - within the thread that called `disconnect`, no callback invocation
///   is delivered after `disconnect` returns;
/// - other threads may still deliver invocations after `disconnect`
///   returns, but only for events that were already in flight when the
///   disconnect was observed.
///
/// This is what allows `disconnect` to be called from arbitrary contexts
/// (including from within the callback being cancelled) without risking
/// deadlock.
pub trait Link: Send + Sync {
    /// Break the connection. Idempotent.
    fn disconnect(&self);

    /// Whether the link is still attached to its service.
    fn is_connected(&self) -> bool;
}

/// Type-erased handle to a registered callback.
#[derive(Clone, Default)]
pub struct Connection {
    link: Option<Arc<dyn Link>>,
}

impl Connection {
    pub(crate) fn new(link: Arc<dyn Link>) -> Self {
        Connection { link: Some(link) }
    }

    /// Break the connection and drop this handle's reference to it.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect();
        }
    }

    /// Whether the connection is still established.
    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }
}

/// Connection handle that disconnects when dropped.
///
/// Useful for objects that track callbacks registered against
/// themselves. Only use this when callback invocations and the drop are
/// known to run on the same thread, or when the callback tolerates the
/// weak cross-thread disconnect guarantee.
#[derive(Default)]
pub struct ScopedConnection {
    connection: Connection,
}

impl ScopedConnection {
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }
}

impl From<Connection> for ScopedConnection {
    fn from(connection: Connection) -> Self {
        ScopedConnection { connection }
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

//! I/O readiness dispatching.
//!
//! Receivers register a callback for readiness events on a file
//! descriptor through [`IoReadyDispatcher::watch`] (or through the
//! [`Reactor`](crate::Reactor), which forwards here). The dispatcher
//! aggregates the event masks of all callbacks registered for a
//! descriptor into one effective mask programmed into the platform
//! readiness backend, and fans observed events back out to the matching
//! callbacks.
//!
//! Concurrency model: any number of threads may call
//! [`IoReadyDispatcher::dispatch`] simultaneously, and callbacks may be
//! registered, modified and disconnected from any thread — including
//! from inside a running callback — without blocking an in-progress
//! dispatch. See the registry module for how that is achieved.

pub(crate) mod dispatcher;
pub(crate) mod fd_table;
pub(crate) mod selector;

use std::sync::Arc;

use crate::connection::{Connection, Link};
use self::fd_table::IoLink;

pub use self::dispatcher::IoReadyDispatcher;

bitflags::bitflags! {
    /// I/O readiness event mask.
    ///
    /// When requesting notification, build the bitwise or of all events
    /// of interest. The callback receives the subset of its mask that
    /// actually occurred. The numeric values are part of the API and are
    /// kept stable so masks can be composed numerically by downstream
    /// programs.
    ///
    /// [`ERROR`](Self::ERROR) and [`HANGUP`](Self::HANGUP) never need to
    /// be requested explicitly: any nonzero mask implicitly includes
    /// them, because error conditions cannot be silenced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoReadyEvents: u32 {
        /// Descriptor is ready for input.
        const INPUT = 0x0001;
        /// Descriptor is ready for output.
        const OUTPUT = 0x0002;
        /// An (unspecified) error occurred on the descriptor.
        const ERROR = 0x0100;
        /// The peer hung up on the descriptor.
        const HANGUP = 0x0200;
    }
}

impl IoReadyEvents {
    /// Nonzero masks always include the unsilenceable error bits.
    pub(crate) fn normalize(self) -> Self {
        if self.is_empty() {
            self
        } else {
            self | IoReadyEvents::ERROR | IoReadyEvents::HANGUP
        }
    }
}

pub(crate) type IoReadyCallback = Box<dyn Fn(IoReadyEvents) + Send + Sync>;

/// Handle to a registered I/O readiness callback.
///
/// Compared to the type-erased [`Connection`] this additionally allows
/// changing the watched event mask, which is much cheaper than
/// disconnecting and registering anew.
#[derive(Clone, Default)]
pub struct IoReadyConnection {
    link: Option<Arc<IoLink>>,
}

impl IoReadyConnection {
    pub(crate) fn new(link: Arc<IoLink>) -> Self {
        IoReadyConnection { link: Some(link) }
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

    /// Change the set of events the callback is notified for.
    ///
    /// An empty mask temporarily disables notification, but error
    /// conditions may still be delivered. Infallible: failures to
    /// reprogram the backend are logged, never surfaced.
    pub fn modify(&self, events: IoReadyEvents) {
        if let Some(link) = &self.link {
            link.modify(events);
        }
    }

    /// The currently watched event mask.
    pub fn event_mask(&self) -> IoReadyEvents {
        self.link
            .as_ref()
            .map_or(IoReadyEvents::empty(), |link| link.event_mask())
    }
}

impl From<IoReadyConnection> for Connection {
    fn from(conn: IoReadyConnection) -> Self {
        match conn.link {
            Some(link) => Connection::new(link),
            None => Connection::default(),
        }
    }
}

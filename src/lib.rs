//! # Vigilis
//!
//! **Vigilis** is a callback-oriented event reactor for building
//! event-driven Unix services. It multiplexes three classes of event
//! source — readiness on file descriptors, expiring timers, and
//! async-safe wake-ups from other threads or signal handlers — into a
//! single dispatch loop that delivers registered callbacks when events
//! fire.
//!
//! The interesting part is not the loop but the concurrency substrate
//! underneath it: callbacks can be registered, modified, invoked and
//! disconnected concurrently from multiple threads without locks on the
//! event-delivery path, and a disconnect is always observed before the
//! callback's owned state is released. Vigilis provides:
//!
//! - **Event flags** — wake a blocked dispatcher from any thread,
//!   exactly once per set/clear cycle, with no spurious and no lost
//!   wake-ups ([`PipeEventFlag`], [`CondvarEventFlag`])
//! - **I/O readiness dispatch** over the platform facility (epoll on
//!   Linux, poll elsewhere), with per-descriptor aggregation of event
//!   masks ([`IoReadyDispatcher`])
//! - **Timers** with reschedule-by-return-value callbacks
//! - **Async-safe triggered procedures** whose submissions coalesce and
//!   may originate in signal handlers
//! - **Connections** — cheap handles for disconnecting and modifying
//!   registered callbacks from any thread, including from inside the
//!   callback itself ([`Connection`], [`ScopedConnection`])
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::{Duration, Instant};
//! use vigilis::{IoReadyEvents, Reactor};
//!
//! fn main() -> vigilis::Result<()> {
//!     let reactor = Reactor::new()?;
//!
//!     // watch a descriptor (e.g. a socket) for input
//!     # let fd = 0;
//!     let _conn = reactor.watch(
//!         |events| {
//!             if events.contains(IoReadyEvents::INPUT) {
//!                 // read from the descriptor
//!             }
//!         },
//!         fd,
//!         IoReadyEvents::INPUT,
//!     )?;
//!
//!     // a periodic timer: return the next deadline to stay armed
//!     let _tick = reactor.timer(
//!         |now| Some(now + Duration::from_secs(1)),
//!         Instant::now() + Duration::from_secs(1),
//!     );
//!
//!     loop {
//!         reactor.dispatch(None, usize::MAX)?;
//!     }
//! }
//! ```
//!
//! ## Threading
//!
//! Any number of threads may call [`Reactor::dispatch`] concurrently;
//! callbacks run on whichever thread observed the event. Registration
//! never blocks an in-progress dispatch and a callback may disconnect
//! any connection — including its own — from inside its invocation.
//!
//! Callbacks are plain closures; the crate is deliberately
//! callback-oriented and assumes no task system. An async runtime
//! adapter belongs at a higher layer: register the task's wake-up as a
//! callback and drive resumption from it.

mod connection;
mod error;
mod eventflag;
mod ioready;
mod reactor;
mod sync;
mod timer;
mod utils;
mod workqueue;

pub use connection::{Connection, Link, ScopedConnection};
pub use error::{Error, Result};
pub use eventflag::{CondvarEventFlag, EventFlag, EventTrigger, PipeEventFlag};
pub use ioready::{IoReadyConnection, IoReadyDispatcher, IoReadyEvents};
pub use reactor::Reactor;
pub use timer::TimerConnection;
pub use workqueue::AsyncSafeConnection;

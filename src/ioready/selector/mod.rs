//! Platform readiness backends.
//!
//! A selector is the dispatcher's view of the operating system readiness
//! facility: program an aggregated event mask per file descriptor, then
//! wait for events with a timeout. The concrete implementation is chosen
//! at compile time; all implementations expose the same interface:
//!
//! - `new()` — allocate the backend (close-on-exec),
//! - `update(fd, old_mask, new_mask)` — reprogram one descriptor from
//!   its previous effective mask to the new one,
//! - `wait(out, timeout, max)` — collect up to `max` events, retrying
//!   interrupted waits as empty returns,
//! - `NEEDS_UPDATE_WAKEUP` — whether threads already blocked in `wait`
//!   must be kicked for a mask update to take effect.

use std::os::fd::RawFd;

use crate::ioready::IoReadyEvents;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub(crate) type Selector = epoll::EpollSelector;

#[cfg(all(unix, not(target_os = "linux")))]
mod poll;

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) type Selector = poll::PollSelector;

#[cfg(not(unix))]
compile_error!("this crate multiplexes Unix file descriptors and only builds on Unix targets");

/// Upper bound on events collected per wait.
pub(crate) const MAX_WAIT_EVENTS: usize = 16;

/// One readiness event reported by the backend.
pub(crate) struct SelectorEvent {
    pub(crate) fd: RawFd,
    pub(crate) events: IoReadyEvents,
}

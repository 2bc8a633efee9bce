//! Linux `epoll`-based selector.
//!
//! One epoll instance carries the aggregated per-descriptor masks; the
//! descriptor number itself is used as the event token, since the
//! dispatcher resolves events through its own handler table. All
//! operations are O(1) in the number of watched descriptors, and
//! `epoll_wait` may be entered from several threads at once.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{SelectorEvent, MAX_WAIT_EVENTS};
use crate::ioready::IoReadyEvents;

pub(crate) struct EpollSelector {
    epoll: OwnedFd,
}

impl EpollSelector {
    /// Level-triggered epoll reports events to every concurrent waiter;
    /// mask updates take effect on descriptors the kernel re-examines on
    /// each wait, so no explicit kick is needed.
    pub(crate) const NEEDS_UPDATE_WAKEUP: bool = false;

    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollSelector {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn update(
        &self,
        fd: RawFd,
        old_mask: IoReadyEvents,
        new_mask: IoReadyEvents,
    ) -> io::Result<()> {
        let (op, mask) = if old_mask.is_empty() {
            if new_mask.is_empty() {
                return Ok(());
            }
            (libc::EPOLL_CTL_ADD, new_mask)
        } else if new_mask.is_empty() {
            (libc::EPOLL_CTL_DEL, old_mask)
        } else {
            (libc::EPOLL_CTL_MOD, new_mask)
        };

        let mut event = libc::epoll_event {
            events: translate_to_os(mask),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn wait(
        &self,
        out: &mut Vec<SelectorEvent>,
        timeout: Option<Duration>,
        max: usize,
    ) -> io::Result<()> {
        let max = max.clamp(1, MAX_WAIT_EVENTS);
        let mut buffer: [libc::epoll_event; MAX_WAIT_EVENTS] = unsafe { mem::zeroed() };

        // round up so a sub-millisecond timeout does not busy-spin
        let timeout_ms = match timeout {
            Some(t) => t
                .as_micros()
                .div_ceil(1000)
                .min(i32::MAX as u128) as i32,
            None => -1,
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                buffer.as_mut_ptr(),
                max as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for event in buffer.iter().take(n as usize) {
            out.push(SelectorEvent {
                fd: event.u64 as RawFd,
                events: translate_from_os(event.events),
            });
        }
        Ok(())
    }
}

fn translate_to_os(mask: IoReadyEvents) -> u32 {
    let mut events = 0;
    if mask.contains(IoReadyEvents::INPUT) {
        events |= libc::EPOLLIN as u32;
    }
    if mask.contains(IoReadyEvents::OUTPUT) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn translate_from_os(events: u32) -> IoReadyEvents {
    let mut mask = IoReadyEvents::empty();
    if events & libc::EPOLLIN as u32 != 0 {
        mask |= IoReadyEvents::INPUT;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask |= IoReadyEvents::OUTPUT;
    }
    // error and hangup conditions are delivered to input and output
    // watchers as well: they will observe them on their next operation
    if events & libc::EPOLLHUP as u32 != 0 {
        mask |= IoReadyEvents::INPUT
            | IoReadyEvents::OUTPUT
            | IoReadyEvents::HANGUP
            | IoReadyEvents::ERROR;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        mask |= IoReadyEvents::INPUT | IoReadyEvents::OUTPUT | IoReadyEvents::ERROR;
    }
    mask
}

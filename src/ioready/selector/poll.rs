//! Portable `poll(2)`-based selector.
//!
//! Fallback for Unix targets without epoll. The registered masks are
//! kept in a table guarded by a mutex and snapshotted into a `pollfd`
//! array on every wait, which makes `wait` O(n) in the number of watched
//! descriptors. Because each waiting thread polls a snapshot, a mask
//! update cannot reach threads that are already blocked; the dispatcher
//! kicks them through its wake-up flag (`NEEDS_UPDATE_WAKEUP`).

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use super::{SelectorEvent, MAX_WAIT_EVENTS};
use crate::ioready::IoReadyEvents;

pub(crate) struct PollSelector {
    registered: Mutex<HashMap<RawFd, IoReadyEvents>>,
}

impl PollSelector {
    pub(crate) const NEEDS_UPDATE_WAKEUP: bool = true;

    pub(crate) fn new() -> io::Result<Self> {
        Ok(PollSelector {
            registered: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn update(
        &self,
        fd: RawFd,
        _old_mask: IoReadyEvents,
        new_mask: IoReadyEvents,
    ) -> io::Result<()> {
        let mut registered = self.registered.lock().unwrap();
        if new_mask.is_empty() {
            registered.remove(&fd);
        } else {
            registered.insert(fd, new_mask);
        }
        Ok(())
    }

    pub(crate) fn wait(
        &self,
        out: &mut Vec<SelectorEvent>,
        timeout: Option<Duration>,
        max: usize,
    ) -> io::Result<()> {
        let mut pollfds: Vec<libc::pollfd> = {
            let registered = self.registered.lock().unwrap();
            registered
                .iter()
                .map(|(&fd, &mask)| libc::pollfd {
                    fd,
                    events: translate_to_os(mask),
                    revents: 0,
                })
                .collect()
        };

        let timeout_ms = match timeout {
            Some(t) => t.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32,
            None => -1,
        };

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let max = max.clamp(1, MAX_WAIT_EVENTS);
        for pfd in pollfds.iter().filter(|pfd| pfd.revents != 0) {
            if out.len() >= max {
                break;
            }
            out.push(SelectorEvent {
                fd: pfd.fd,
                events: translate_from_os(pfd.revents),
            });
        }
        Ok(())
    }
}

fn translate_to_os(mask: IoReadyEvents) -> libc::c_short {
    let mut events = 0;
    if mask.contains(IoReadyEvents::INPUT) {
        events |= libc::POLLIN;
    }
    if mask.contains(IoReadyEvents::OUTPUT) {
        events |= libc::POLLOUT;
    }
    events
}

fn translate_from_os(revents: libc::c_short) -> IoReadyEvents {
    let mut mask = IoReadyEvents::empty();
    if revents & libc::POLLIN != 0 {
        mask |= IoReadyEvents::INPUT;
    }
    if revents & libc::POLLOUT != 0 {
        mask |= IoReadyEvents::OUTPUT;
    }
    if revents & libc::POLLHUP != 0 {
        mask |= IoReadyEvents::INPUT
            | IoReadyEvents::OUTPUT
            | IoReadyEvents::HANGUP
            | IoReadyEvents::ERROR;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        mask |= IoReadyEvents::INPUT | IoReadyEvents::OUTPUT | IoReadyEvents::ERROR;
    }
    mask
}

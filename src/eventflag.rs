//! Event flags: single-slot wake-up primitives.
//!
//! An event flag carries one bit of "something happened" state between
//! threads. Setting an already-set flag is a no-op, waiting on a set flag
//! returns immediately, and clearing consumes the state. The flag never
//! produces spurious wake-ups and never loses a `set`.
//!
//! Two implementations are provided:
//! - [`PipeEventFlag`] is backed by a pipe pair, which makes it usable as
//!   a readiness source: the dispatcher watches the read end so that a
//!   `set` from any thread (or a signal handler) interrupts a blocking
//!   wait.
//! - [`CondvarEventFlag`] is a file-descriptor-less variant with the same
//!   semantics, for callers that only ever block in [`EventFlag::wait`].

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Something that can be raised to wake another thread.
///
/// This is the only capability the timer queue and the async work queue
/// need from the dispatcher's wake-up flag, and the only operation that
/// is safe to call from a signal handler (for [`PipeEventFlag`]).
pub trait EventTrigger: Send + Sync {
    /// Raise the flag. Idempotent while the flag remains set.
    fn set(&self);
}

/// A full event flag: a trigger that can also be waited on and cleared.
pub trait EventFlag: EventTrigger {
    /// Block until the flag is set. Returns immediately if it already is.
    fn wait(&self);

    /// Reset the flag to the cleared state.
    fn clear(&self);
}

/// Flag is not set.
const CLEARED: u8 = 0;
/// Flag is set; nobody was waiting when it was raised.
const SET_NO_WAKE: u8 = 1;
/// Flag is set and a wake-up byte is in the pipe.
const SET_WAKE_POSTED: u8 = 2;

/// Pipe-backed event flag.
///
/// The three-state encoding distinguishes "set but nobody is asleep"
/// (one compare-and-swap) from "set with a wake-up byte in flight" (a
/// pipe write). The common set/clear cycle therefore stays free of
/// syscalls. Invariant: a byte sits in the pipe exactly when the state
/// is `SET_WAKE_POSTED`.
///
/// Both pipe ends are opened close-on-exec. `set` is async-signal-safe;
/// construction, `wait` and `clear` are not.
pub struct PipeEventFlag {
    flagged: AtomicU8,
    waiting: AtomicUsize,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl PipeEventFlag {
    /// Create a new flag in the cleared state.
    ///
    /// Fails with [`Error::ResourceExhausted`] if the control pipe cannot
    /// be allocated.
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = create_pipe().map_err(Error::ResourceExhausted)?;
        Ok(PipeEventFlag {
            flagged: AtomicU8::new(CLEARED),
            waiting: AtomicUsize::new(0),
            read_fd,
            write_fd,
        })
    }

    /// The read end of the control pipe.
    ///
    /// Becomes readable when a wake-up has been posted; the byte is
    /// consumed by [`EventFlag::clear`], not by the reader.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Whether the flag is currently set.
    pub fn is_set(&self) -> bool {
        self.flagged.load(Ordering::Acquire) != CLEARED
    }

    /// Announce that the calling thread is about to block on the read end.
    ///
    /// This is the first half of the wait protocol, split out so that the
    /// dispatcher can block in its readiness backend (with the read end
    /// registered there) while remaining wake-able. After incrementing
    /// the waiter count the caller must re-check [`Self::is_set`]; that
    /// store/load sequence closes the lost-wake-up window against a
    /// concurrent `set`.
    pub fn start_waiting(&self) {
        self.waiting.fetch_add(1, Ordering::Relaxed);
    }

    /// Retract [`Self::start_waiting`].
    pub fn stop_waiting(&self) {
        self.waiting.fetch_sub(1, Ordering::Relaxed);
    }

    fn set_impl(&self) {
        // fast path: already set, nothing to publish
        if self.flagged.load(Ordering::Relaxed) != CLEARED {
            return;
        }

        // Only one setter may observe the 0 -> 1 transition; release
        // ordering publishes whatever state the setter produced before
        // raising the flag.
        if self
            .flagged
            .compare_exchange(CLEARED, SET_NO_WAKE, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        // Nobody marked themselves waiting before the transition, so
        // there is nobody to wake.
        if self.waiting.load(Ordering::Relaxed) == 0 {
            return;
        }

        // At least one thread is (or is about to be) asleep: post the
        // wake-up byte. If this fails, a clear raced us and the flag is
        // back to a state where no byte belongs in the pipe.
        if self
            .flagged
            .compare_exchange(
                SET_NO_WAKE,
                SET_WAKE_POSTED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return;
        }

        let byte = 0u8;
        loop {
            let n = unsafe {
                libc::write(
                    self.write_fd.as_raw_fd(),
                    &byte as *const u8 as *const libc::c_void,
                    1,
                )
            };
            if n == 1 {
                break;
            }
        }
    }

    fn wait_impl(&self) {
        if self.flagged.load(Ordering::Acquire) != CLEARED {
            return;
        }

        self.start_waiting();

        if self.flagged.load(Ordering::Acquire) == CLEARED {
            let mut pfd = libc::pollfd {
                fd: self.read_fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            loop {
                let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
                if rc > 0 && (pfd.revents & libc::POLLIN) != 0 {
                    break;
                }
            }
        }

        self.stop_waiting();
    }

    fn clear_impl(&self) {
        let mut old = self.flagged.load(Ordering::Relaxed);
        loop {
            if old == CLEARED {
                return;
            }
            // Acquire so that the caller's subsequent inspection of its
            // condition state cannot be hoisted above the clear.
            match self
                .flagged
                .compare_exchange(old, CLEARED, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => old = observed,
            }
        }

        if old == SET_NO_WAKE {
            return;
        }

        // A wake-up byte was posted the last time the flag was raised.
        let mut byte = 0u8;
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd.as_raw_fd(),
                    &mut byte as *mut u8 as *mut libc::c_void,
                    1,
                )
            };
            if n == 1 {
                break;
            }
        }
    }
}

impl EventTrigger for PipeEventFlag {
    fn set(&self) {
        self.set_impl();
    }
}

impl EventFlag for PipeEventFlag {
    fn wait(&self) {
        self.wait_impl();
    }

    fn clear(&self) {
        self.clear_impl();
    }
}

/// Event flag built from a mutex and a condition variable.
///
/// Semantically identical to [`PipeEventFlag`] but consumes no file
/// descriptors, so it cannot serve as a readiness source and `set` is
/// not async-signal-safe. Useful for tests and for callers that only
/// ever block in [`EventFlag::wait`].
pub struct CondvarEventFlag {
    flagged: Mutex<bool>,
    cond: Condvar,
}

impl CondvarEventFlag {
    pub fn new() -> Self {
        CondvarEventFlag {
            flagged: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Whether the flag is currently set.
    pub fn is_set(&self) -> bool {
        *self.flagged.lock().unwrap()
    }
}

impl Default for CondvarEventFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTrigger for CondvarEventFlag {
    fn set(&self) {
        let mut flagged = self.flagged.lock().unwrap();
        *flagged = true;
        self.cond.notify_all();
    }
}

impl EventFlag for CondvarEventFlag {
    fn wait(&self) {
        let mut flagged = self.flagged.lock().unwrap();
        while !*flagged {
            flagged = self.cond.wait(flagged).unwrap();
        }
    }

    fn clear(&self) {
        *self.flagged.lock().unwrap() = false;
    }
}

fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    #[cfg(target_os = "linux")]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    #[cfg(not(target_os = "linux"))]
    let rc = {
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc == 0 {
            unsafe {
                libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
                libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        rc
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pipe_eventflag_state_transitions() {
        let flag = PipeEventFlag::new().unwrap();

        assert_eq!(flag.flagged.load(Ordering::Relaxed), CLEARED);
        flag.set();
        assert_eq!(flag.flagged.load(Ordering::Relaxed), SET_NO_WAKE);
        flag.clear();
        assert_eq!(flag.flagged.load(Ordering::Relaxed), CLEARED);

        flag.start_waiting();
        assert_eq!(flag.waiting.load(Ordering::Relaxed), 1);
        flag.stop_waiting();
        assert_eq!(flag.waiting.load(Ordering::Relaxed), 0);

        flag.set();
        assert_eq!(flag.flagged.load(Ordering::Relaxed), SET_NO_WAKE);
        flag.clear();
    }

    #[test]
    fn set_posts_wakeup_byte_for_waiters() {
        let flag = PipeEventFlag::new().unwrap();

        flag.start_waiting();
        flag.set();
        assert_eq!(
            flag.flagged.load(Ordering::Relaxed),
            SET_WAKE_POSTED,
            "a waiter was announced, so a wake-up byte must be posted"
        );
        // wait must not block: the byte is already in the pipe
        flag.wait();
        flag.stop_waiting();
        flag.clear();
        assert_eq!(flag.flagged.load(Ordering::Relaxed), CLEARED);
    }

    #[test]
    fn cross_thread_wakeup() {
        let flag = Arc::new(PipeEventFlag::new().unwrap());

        let setter = {
            let flag = flag.clone();
            thread::spawn(move || flag.set())
        };

        flag.wait();
        assert!(flag.is_set(), "wait returned, so the flag must be set");
        flag.clear();
        setter.join().unwrap();
    }

    #[test]
    fn condvar_eventflag_roundtrip() {
        let flag = Arc::new(CondvarEventFlag::new());

        let setter = {
            let flag = flag.clone();
            thread::spawn(move || flag.set())
        };

        flag.wait();
        flag.clear();
        setter.join().unwrap();

        // wait on an already-set flag returns immediately
        flag.set();
        flag.wait();
    }
}

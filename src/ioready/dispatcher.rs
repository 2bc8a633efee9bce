//! The I/O readiness dispatcher.
//!
//! Glues the registry, the deferred lock, the wake-up flag and the
//! platform selector together:
//!
//! - registrations and disconnects take the write side of the deferred
//!   lock, mutate the registry, and reprogram the selector with the
//!   descriptor's new effective mask;
//! - `dispatch` waits on the selector, then delivers events under the
//!   read side, so no registration ever blocks event delivery (and a
//!   callback may disconnect itself or any other callback mid-dispatch);
//! - whoever leaves the lock last commits staged removals and releases
//!   the reclaimed links outside all locks.
//!
//! The wake-up flag is created lazily by [`IoReadyDispatcher::event_trigger`]
//! and its pipe read end is watched like any other descriptor. Raising
//! it makes a blocked `dispatch` return early; the wake-up byte is
//! consumed by the flag's `clear`, so the watch callback itself has
//! nothing to do.

use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::eventflag::{EventFlag, EventTrigger, PipeEventFlag};
use crate::ioready::fd_table::{FdTable, IoLink};
use crate::ioready::selector::{Selector, SelectorEvent, MAX_WAIT_EVENTS};
use crate::ioready::{IoReadyCallback, IoReadyConnection, IoReadyEvents};
use crate::sync::deferred::{SyncGuard, WriteGuard};
use crate::sync::DeferrableRwLock;

pub(crate) struct DispatcherInner {
    selector: Selector,
    fdtab: FdTable,
    lock: DeferrableRwLock,
    wakeup: OnceLock<Arc<PipeEventFlag>>,
    wakeup_init: Mutex<()>,
    self_weak: Weak<DispatcherInner>,
}

/// Dispatcher for I/O readiness events.
///
/// Stand-alone component: it watches file descriptors and delivers
/// readiness callbacks, nothing else. The [`Reactor`](crate::Reactor)
/// composes it with timers and the async work queue.
///
/// `dispatch` may be entered from multiple threads concurrently. With a
/// level-triggered backend several threads may then observe (and
/// dispatch) the same event, so multi-threaded use is only useful when
/// callbacks tolerate that.
pub struct IoReadyDispatcher {
    inner: Arc<DispatcherInner>,
}

impl IoReadyDispatcher {
    /// Create a dispatcher over the platform's readiness backend.
    pub fn new() -> Result<Self> {
        let selector = Selector::new().map_err(Error::ResourceExhausted)?;
        let inner = Arc::new_cyclic(|self_weak| DispatcherInner {
            selector,
            fdtab: FdTable::new(32),
            lock: DeferrableRwLock::new(),
            wakeup: OnceLock::new(),
            wakeup_init: Mutex::new(()),
            self_weak: self_weak.clone(),
        });
        log::debug!("io-ready dispatcher created");
        Ok(IoReadyDispatcher { inner })
    }

    /// Register a callback for readiness events on `fd`.
    ///
    /// The callback receives the subset of `events` that occurred. A
    /// nonzero mask implicitly includes [`IoReadyEvents::ERROR`] and
    /// [`IoReadyEvents::HANGUP`].
    ///
    /// The caller must keep `fd` open until the connection has been
    /// disconnected and reclaimed.
    pub fn watch<F>(&self, function: F, fd: RawFd, events: IoReadyEvents) -> Result<IoReadyConnection>
    where
        F: Fn(IoReadyEvents) + Send + Sync + 'static,
    {
        self.inner.watch(Box::new(function), fd, events)
    }

    /// Wait for events and deliver callbacks.
    ///
    /// Returns the number of backend events processed. Returns early
    /// when the wake-up flag is raised, when the timeout expires, or
    /// after at most `max` events. `None` waits indefinitely.
    pub fn dispatch(&self, timeout: Option<Duration>, max: usize) -> Result<usize> {
        self.inner.dispatch(timeout, max)
    }

    /// Deliver already-pending events without waiting.
    pub fn dispatch_pending(&self, max: usize) -> Result<usize> {
        self.inner.dispatch_pending(max)
    }

    /// The wake-up flag associated with this dispatcher.
    ///
    /// Created on first use; the flag lives as long as the dispatcher.
    /// Raising it (from any thread, or from a signal handler) interrupts
    /// one blocked or upcoming `dispatch` call.
    pub fn event_trigger(&self) -> Result<Arc<PipeEventFlag>> {
        self.inner.event_trigger()
    }
}

impl Drop for IoReadyDispatcher {
    fn drop(&mut self) {
        // Disconnect everything under the read side: the disconnects
        // stage removals without blocking against a dispatch that might
        // still be draining on another thread.
        let inner = &self.inner;
        while let Some(sync) = inner.lock.read_lock() {
            inner.synchronize(sync);
        }
        inner.fdtab.disconnect_all();
        match inner.lock.read_unlock() {
            Some(sync) => inner.synchronize(sync),
            None => {
                // A concurrent party still holds the lock; wait it out
                // so every staged removal is reclaimed before the
                // registry is torn down.
                let sync = inner.lock.write_lock_sync();
                inner.synchronize(sync);
            }
        }
    }
}

impl DispatcherInner {
    fn watch(
        &self,
        function: IoReadyCallback,
        fd: RawFd,
        events: IoReadyEvents,
    ) -> Result<IoReadyConnection> {
        let events = events.normalize();
        let link = Arc::new(IoLink::new(function, fd, events, self.self_weak.clone()));

        let guard = self.lock.write_lock_async();
        let (old_mask, new_mask) = self.fdtab.insert(&link);
        if let Err(err) = self.selector.update(fd, old_mask, new_mask) {
            // Roll the registration back; the backend was never
            // reprogrammed, so only the registry needs to be undone.
            self.fdtab.remove(&link);
            link.abandon();
            self.finish_write(guard);
            return Err(Error::AllocationFailed(err));
        }
        self.finish_write(guard);
        self.kick_waiters();

        Ok(IoReadyConnection::new(link))
    }

    /// Detach a link. Called with the link's cancellation gate held; the
    /// gate is released after the registry mutation so a racing modify
    /// observes either the attached or the fully detached state.
    pub(crate) fn remove_link(
        &self,
        link: &IoLink,
        gate: MutexGuard<'_, Option<Weak<DispatcherInner>>>,
    ) {
        let guard = self.lock.write_lock_async();
        if link.mark_disconnected() {
            let (old_mask, new_mask) = self.fdtab.remove(link);
            if old_mask != new_mask {
                if let Err(err) = self.selector.update(link.fd(), old_mask, new_mask) {
                    log::warn!(
                        "failed to reprogram fd {} after disconnect: {}",
                        link.fd(),
                        err
                    );
                }
            }
        }
        drop(gate);
        self.finish_write(guard);
        self.kick_waiters();
    }

    /// Re-aggregate a descriptor's mask after a link changed its own.
    /// Called with the link's cancellation gate held.
    pub(crate) fn modify_link(&self, link: &IoLink, events: IoReadyEvents) {
        let guard = self.lock.write_lock_async();
        let (old_mask, new_mask) = self.fdtab.modify_mask(link, events);
        if old_mask != new_mask {
            if let Err(err) = self.selector.update(link.fd(), old_mask, new_mask) {
                log::warn!("failed to reprogram fd {} after modify: {}", link.fd(), err);
            }
        }
        self.finish_write(guard);
        self.kick_waiters();
    }

    fn dispatch(&self, timeout: Option<Duration>, max: usize) -> Result<usize> {
        let cookie = self.fdtab.cookie();
        let mut events = Vec::with_capacity(max.clamp(1, MAX_WAIT_EVENTS));

        match self.wakeup.get() {
            None => {
                self.selector
                    .wait(&mut events, timeout, max)
                    .map_err(Error::Backend)?;
                self.process_events(&events, cookie)?;
            }
            Some(flag) => {
                // Announce the wait before blocking: a set() that lands
                // in between will be observed by the re-check and turn
                // the wait into a poll.
                flag.start_waiting();
                let timeout = if flag.is_set() {
                    Some(Duration::ZERO)
                } else {
                    timeout
                };
                let waited = self.selector.wait(&mut events, timeout, max);
                flag.stop_waiting();
                waited.map_err(Error::Backend)?;

                self.process_events(&events, cookie)?;
                flag.clear();
            }
        }

        Ok(events.len())
    }

    fn dispatch_pending(&self, max: usize) -> Result<usize> {
        let cookie = self.fdtab.cookie();
        let mut events = Vec::with_capacity(max.clamp(1, MAX_WAIT_EVENTS));

        self.selector
            .wait(&mut events, Some(Duration::ZERO), max)
            .map_err(Error::Backend)?;
        self.process_events(&events, cookie)?;

        if let Some(flag) = self.wakeup.get() {
            flag.clear();
        }
        Ok(events.len())
    }

    fn process_events(&self, events: &[SelectorEvent], cookie: u32) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let guard = ReadGuard::acquire(self);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            for event in events {
                self.fdtab.notify(event.fd, event.events, cookie);
            }
        }));
        drop(guard);

        outcome.map_err(|payload| {
            log::error!("io readiness callback panicked; remaining events of this batch dropped");
            Error::callback_failed(payload)
        })
    }

    fn event_trigger(&self) -> Result<Arc<PipeEventFlag>> {
        if let Some(flag) = self.wakeup.get() {
            return Ok(flag.clone());
        }

        let _init = self.wakeup_init.lock().unwrap();
        if let Some(flag) = self.wakeup.get() {
            return Ok(flag.clone());
        }

        let flag = Arc::new(PipeEventFlag::new()?);
        // The wake-up byte is consumed by the flag's clear(), so the
        // watch only exists to make the pipe interrupt the selector.
        self.watch(Box::new(|_| {}), flag.read_fd(), IoReadyEvents::INPUT)?;
        let _ = self.wakeup.set(flag.clone());
        Ok(flag)
    }

    fn synchronize(&self, guard: SyncGuard<'_>) {
        let stale = self.fdtab.synchronize();
        guard.finish();
        // Reclaimed closures are dropped here, outside all locks; their
        // destructors may re-enter the dispatcher.
        drop(stale);
    }

    fn finish_write(&self, guard: WriteGuard<'_>) {
        if let Some(sync) = guard.into_sync() {
            self.synchronize(sync);
        }
    }

    fn kick_waiters(&self) {
        if Selector::NEEDS_UPDATE_WAKEUP {
            if let Some(flag) = self.wakeup.get() {
                flag.set();
            }
        }
    }
}

/// Read-side guard over the registry.
///
/// Exists so the read lock is released (and a pending commit performed)
/// even when a callback panics mid-delivery.
struct ReadGuard<'a> {
    inner: &'a DispatcherInner,
}

impl<'a> ReadGuard<'a> {
    fn acquire(inner: &'a DispatcherInner) -> Self {
        while let Some(sync) = inner.lock.read_lock() {
            inner.synchronize(sync);
        }
        ReadGuard { inner }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(sync) = self.inner.lock.read_unlock() {
            self.inner.synchronize(sync);
        }
    }
}

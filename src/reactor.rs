//! The compound reactor.
//!
//! Combines the I/O readiness dispatcher with the timer queue, the
//! async-safe work queue and a one-shot posted-work queue behind a
//! single dispatch surface. The timer and work queues share the
//! dispatcher's wake-up flag: registering an earlier timer, triggering
//! an async procedure or posting work interrupts a blocked dispatch so
//! the new work is picked up promptly.
//!
//! A dispatch pass performs, in order: wait for readiness (bounded by
//! the nearest timer deadline), deliver readiness callbacks, clear the
//! wake-up flag, drain posted and async work, and expire due timers.
//! Multiple threads may run passes concurrently; callbacks must be
//! prepared to run on whichever thread observed their event.

use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::eventflag::{EventTrigger, PipeEventFlag};
use crate::ioready::{IoReadyConnection, IoReadyDispatcher, IoReadyEvents};
use crate::timer::{TimerConnection, TimerQueue};
use crate::workqueue::{AsyncSafeConnection, AsyncWorkQueue};

type PostedWork = Box<dyn FnOnce() + Send>;

/// Reactor for event-driven Unix services.
///
/// Clients register callbacks for file descriptor readiness
/// ([`watch`](Self::watch)), deadlines ([`timer`](Self::timer)) and
/// cross-thread wake-ups ([`async_procedure`](Self::async_procedure),
/// [`post`](Self::post)); one or more threads then run
/// [`dispatch`](Self::dispatch) in a loop to deliver them.
pub struct Reactor {
    io: IoReadyDispatcher,
    trigger: Arc<PipeEventFlag>,
    timers: TimerQueue,
    async_work: AsyncWorkQueue,
    posted: Mutex<VecDeque<PostedWork>>,
    posted_count: AtomicUsize,
}

impl Reactor {
    /// Create a reactor.
    ///
    /// Allocates the readiness backend and the wake-up flag (one pipe
    /// pair); everything is opened close-on-exec.
    pub fn new() -> Result<Self> {
        let io = IoReadyDispatcher::new()?;
        let trigger = io.event_trigger()?;
        Ok(Reactor {
            timers: TimerQueue::new(trigger.clone()),
            async_work: AsyncWorkQueue::new(trigger.clone()),
            io,
            trigger,
            posted: Mutex::new(VecDeque::new()),
            posted_count: AtomicUsize::new(0),
        })
    }

    /// Register a callback for readiness events on `fd`.
    ///
    /// See [`IoReadyDispatcher::watch`].
    pub fn watch<F>(&self, function: F, fd: RawFd, events: IoReadyEvents) -> Result<IoReadyConnection>
    where
        F: Fn(IoReadyEvents) + Send + Sync + 'static,
    {
        self.io.watch(function, fd, events)
    }

    /// Register a timer due at `deadline`.
    ///
    /// The callback receives the expiry time and returns the next
    /// deadline to re-arm itself, or `None` to disconnect.
    pub fn timer<F>(&self, function: F, deadline: Instant) -> TimerConnection
    where
        F: Fn(Instant) -> Option<Instant> + Send + Sync + 'static,
    {
        self.timers.timer(Box::new(function), deadline)
    }

    /// Register a procedure that can be triggered in an async-safe way.
    ///
    /// Triggering the returned connection (from any thread, or from a
    /// signal handler) makes a dispatching thread invoke the procedure;
    /// triggers coalesce while an invocation is already pending.
    pub fn async_procedure<F>(&self, function: F) -> AsyncSafeConnection
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.async_work.async_procedure(Box::new(function))
    }

    /// Submit a one-shot function to be run by a dispatching thread.
    ///
    /// Not async-signal-safe (it allocates); use
    /// [`async_procedure`](Self::async_procedure) for that.
    pub fn post<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.posted.lock().unwrap().push_back(Box::new(function));
        self.posted_count.fetch_add(1, Ordering::Release);
        self.trigger.set();
    }

    /// The reactor's wake-up flag.
    ///
    /// Raising it makes one blocked or upcoming [`dispatch`](Self::dispatch)
    /// call return early instead of waiting out its timeout.
    pub fn event_trigger(&self) -> &Arc<PipeEventFlag> {
        &self.trigger
    }

    /// Run one dispatch pass.
    ///
    /// Waits up to `timeout` (`None` = until the nearest timer, or
    /// indefinitely if none), then delivers pending readiness events,
    /// posted and async work, and due timers. At most `max` readiness
    /// events and `max` timers are processed; the return value is the
    /// total number of events and callbacks handled, which may be zero
    /// on timeout or premature wake-up.
    pub fn dispatch(&self, timeout: Option<Duration>, max: usize) -> Result<usize> {
        let now = Instant::now();
        let timeout = effective_timeout(timeout, self.timers.next_due(), now);

        let mut processed = self.io.dispatch(timeout, max)?;
        processed += self.run_posted()?;
        processed += self.async_work.dispatch()?;
        processed += self.timers.run(Instant::now(), max)?;
        Ok(processed)
    }

    /// Deliver pending events without waiting.
    ///
    /// The wake-up flag is cleared even when nothing was pending.
    pub fn dispatch_pending(&self, max: usize) -> Result<usize> {
        let mut processed = self.io.dispatch_pending(max)?;
        processed += self.run_posted()?;
        processed += self.async_work.dispatch()?;
        processed += self.timers.run(Instant::now(), max)?;
        Ok(processed)
    }

    /// Deliver pending events without waiting until none remain.
    pub fn dispatch_pending_all(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let processed = self.dispatch_pending(usize::MAX)?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    /// Run one posted work item, re-raising the wake-up flag while more
    /// remain so that consecutive passes interleave posted work with the
    /// other event sources instead of starving them.
    fn run_posted(&self) -> Result<usize> {
        if self.posted_count.load(Ordering::Acquire) == 0 {
            return Ok(0);
        }
        let item = self.posted.lock().unwrap().pop_front();
        let Some(item) = item else {
            return Ok(0);
        };
        self.posted_count.fetch_sub(1, Ordering::Release);
        if self.posted_count.load(Ordering::Acquire) != 0 {
            // raised before running: a panic must not lose the wake-up
            self.trigger.set();
        }

        catch_unwind(AssertUnwindSafe(item)).map_err(|payload| {
            log::error!("posted work panicked");
            Error::callback_failed(payload)
        })?;
        Ok(1)
    }
}

fn effective_timeout(
    timeout: Option<Duration>,
    next_due: Option<Instant>,
    now: Instant,
) -> Option<Duration> {
    match next_due {
        None => timeout,
        Some(due) => {
            let until_due = due.saturating_duration_since(now);
            Some(timeout.map_or(until_due, |t| t.min(until_due)))
        }
    }
}

//! Timer queue.
//!
//! Timers are kept in a binary min-heap of deadline-ordered entries.
//! Disconnecting or re-arming a timer does not search the heap: each
//! link carries a generation counter, entries remember the generation
//! they were queued with, and entries whose generation no longer matches
//! are discarded lazily when they surface at the top of the heap.
//!
//! A timer callback receives the expiry time and returns the next
//! deadline, or `None` to finish: returning `Some(next)` re-arms the
//! timer, which makes periodic timers a one-liner without a separate
//! registration flavor.
//!
//! Registering or re-arming a timer that becomes the earliest deadline
//! raises the dispatcher's wake-up flag, so a blocked dispatch re-computes
//! its timeout.

use std::cell::UnsafeCell;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::connection::{Connection, Link};
use crate::error::{Error, Result};
use crate::eventflag::EventTrigger;

pub(crate) type TimerCallback = Box<dyn Fn(Instant) -> Option<Instant> + Send + Sync>;

/// A registered timer.
///
/// The closure's lifetime is guarded by a hold count rather than by the
/// reference count: stale heap entries may keep the link allocation
/// alive for a while, but the closure itself is dropped as soon as the
/// timer is disconnected and no invocation is in flight. In particular,
/// a callback that disconnects its own connection keeps executing on
/// intact state; the closure is released only after it returns.
pub(crate) struct TimerLink {
    /// Cleared when the hold count drops to zero.
    function: UnsafeCell<Option<TimerCallback>>,
    /// One hold for being registered, plus one per in-flight invocation.
    hold: AtomicUsize,
    /// Bumped on re-arm and disconnect; invalidates queued entries.
    generation: AtomicU64,
    connected: AtomicBool,
    /// Cancellation gate and back-pointer to the owning queue.
    registry: Mutex<Option<Weak<TimerShared>>>,
}

// Safety: the closure cell is only read while a hold is guaranteed (see
// try_acquire_hold) and only cleared by the final release.
unsafe impl Send for TimerLink {}
unsafe impl Sync for TimerLink {}

impl TimerLink {
    fn try_acquire_hold(&self) -> bool {
        let mut count = self.hold.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return false;
            }
            match self.hold.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => count = observed,
            }
        }
    }

    fn release_hold(&self) {
        if self.hold.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            unsafe {
                *self.function.get() = None;
            }
        }
    }

    /// Invoke the callback. A hold must be held by the caller.
    fn invoke(&self, now: Instant) -> Option<Option<Instant>> {
        unsafe { (*self.function.get()).as_ref() }.map(|function| function(now))
    }
}

impl Link for TimerLink {
    fn disconnect(&self) {
        let mut registry = self.registry.lock().unwrap();
        if registry.take().is_none() {
            return;
        }
        self.connected.store(false, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Relaxed);
        drop(registry);
        // release the "registered" hold; drops the closure once no
        // invocation is in flight anymore
        self.release_hold();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Handle to a registered timer.
#[derive(Clone, Default)]
pub struct TimerConnection {
    link: Option<Arc<TimerLink>>,
}

impl TimerConnection {
    fn new(link: Arc<TimerLink>) -> Self {
        TimerConnection { link: Some(link) }
    }

    /// Break the connection and drop this handle's reference to it.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect();
        }
    }

    /// Whether the timer is still registered.
    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }

    /// Move the timer to a new deadline, superseding the current one.
    ///
    /// No-op on a disconnected timer.
    pub fn rearm(&self, deadline: Instant) {
        let Some(link) = &self.link else {
            return;
        };
        let registry = link.registry.lock().unwrap();
        if let Some(shared) = registry.as_ref().and_then(Weak::upgrade) {
            let generation = link.generation.fetch_add(1, Ordering::Relaxed) + 1;
            shared.insert(TimerEntry {
                deadline,
                generation,
                link: link.clone(),
            });
        }
    }
}

impl From<TimerConnection> for Connection {
    fn from(conn: TimerConnection) -> Self {
        match conn.link {
            Some(link) => Connection::new(link),
            None => Connection::default(),
        }
    }
}

/// An entry in the timer heap.
///
/// Ordering is reversed so that `BinaryHeap` behaves as a min-heap and
/// pops the earliest deadline first.
struct TimerEntry {
    deadline: Instant,
    generation: u64,
    link: Arc<TimerLink>,
}

impl TimerEntry {
    fn is_current(&self) -> bool {
        self.link.connected.load(Ordering::Relaxed)
            && self.link.generation.load(Ordering::Relaxed) == self.generation
    }
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct TimerShared {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    trigger: Arc<dyn EventTrigger>,
}

impl TimerShared {
    fn insert(&self, entry: TimerEntry) {
        let wake = {
            let mut heap = self.heap.lock().unwrap();
            let is_new_min = heap
                .peek()
                .map_or(true, |top| entry.deadline < top.deadline);
            heap.push(entry);
            is_new_min
        };
        if wake {
            self.trigger.set();
        }
    }
}

pub(crate) struct TimerQueue {
    shared: Arc<TimerShared>,
}

impl TimerQueue {
    pub(crate) fn new(trigger: Arc<dyn EventTrigger>) -> Self {
        TimerQueue {
            shared: Arc::new(TimerShared {
                heap: Mutex::new(BinaryHeap::new()),
                trigger,
            }),
        }
    }

    /// Register a timer due at `deadline`.
    pub(crate) fn timer(&self, function: TimerCallback, deadline: Instant) -> TimerConnection {
        let link = Arc::new(TimerLink {
            function: UnsafeCell::new(Some(function)),
            hold: AtomicUsize::new(1),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            registry: Mutex::new(Some(Arc::downgrade(&self.shared))),
        });
        self.shared.insert(TimerEntry {
            deadline,
            generation: 0,
            link: link.clone(),
        });
        TimerConnection::new(link)
    }

    /// When the earliest live timer is due, if any.
    ///
    /// Prunes superseded entries from the top of the heap along the way.
    /// The result races with concurrent registration by design: a timer
    /// inserted afterwards raises the trigger, so a dispatcher that
    /// clears the flag before checking never oversleeps.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        let mut heap = self.shared.heap.lock().unwrap();
        loop {
            let (deadline, current) = match heap.peek() {
                None => return None,
                Some(top) => (top.deadline, top.is_current()),
            };
            if current {
                return Some(deadline);
            }
            heap.pop();
        }
    }

    /// Run every timer due at `now`, at most `limit` of them.
    pub(crate) fn run(&self, now: Instant, limit: usize) -> Result<usize> {
        let mut count = 0;
        while count < limit && self.run_single(now)? {
            count += 1;
        }
        Ok(count)
    }

    /// Run the earliest due timer, if any. Returns whether one ran.
    fn run_single(&self, now: Instant) -> Result<bool> {
        loop {
            let entry = {
                let mut heap = self.shared.heap.lock().unwrap();
                loop {
                    let (deadline, current) = match heap.peek() {
                        None => return Ok(false),
                        Some(top) => (top.deadline, top.is_current()),
                    };
                    if !current {
                        heap.pop();
                        continue;
                    }
                    if now < deadline {
                        return Ok(false);
                    }
                    break;
                }
                heap.pop().expect("peeked entry vanished under the heap lock")
            };

            // A disconnect may still race in here; the hold acquisition
            // fails once the closure release has begun, and the entry is
            // then just a stale reference to drop.
            if !entry.link.try_acquire_hold() {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| entry.link.invoke(now)));

            return match outcome {
                Ok(None) => {
                    // closure already released by a concurrent disconnect
                    entry.link.release_hold();
                    continue;
                }
                Ok(Some(Some(next_deadline))) => {
                    self.rearm_after_run(&entry, next_deadline);
                    entry.link.release_hold();
                    Ok(true)
                }
                Ok(Some(None)) => {
                    entry.link.disconnect();
                    entry.link.release_hold();
                    Ok(true)
                }
                Err(payload) => {
                    log::error!("timer callback panicked; timer disconnected");
                    entry.link.disconnect();
                    entry.link.release_hold();
                    Err(Error::callback_failed(payload))
                }
            };
        }
    }

    /// Re-queue a timer whose callback asked for another round, unless
    /// the callback itself disconnected or re-armed the link.
    fn rearm_after_run(&self, entry: &TimerEntry, deadline: Instant) {
        let registry = entry.link.registry.lock().unwrap();
        if registry.is_some() && entry.link.generation.load(Ordering::Relaxed) == entry.generation
        {
            drop(registry);
            self.shared.insert(TimerEntry {
                deadline,
                generation: entry.generation,
                link: entry.link.clone(),
            });
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        // Detach every queued timer so closures are released now rather
        // than when the last user handle goes away. Entries are moved
        // out first: disconnect takes per-link locks that must nest
        // outside the heap lock.
        let entries: Vec<TimerEntry> = {
            let mut heap = self.shared.heap.lock().unwrap();
            heap.drain().collect()
        };
        for entry in entries {
            entry.link.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventflag::CondvarEventFlag;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn queue() -> TimerQueue {
        TimerQueue::new(Arc::new(CondvarEventFlag::new()))
    }

    #[test]
    fn one_shot_fires_once_and_detaches() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_cb = fired.clone();
        let conn = queue.timer(
            Box::new(move |_| {
                fired_in_cb.fetch_add(1, Ordering::Relaxed);
                None
            }),
            Instant::now(),
        );

        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 1);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(!conn.is_connected(), "returning None must disconnect");
        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 0);
    }

    #[test]
    fn reschedule_by_return_value() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_cb = fired.clone();
        let _conn = queue.timer(
            Box::new(move |now| {
                if fired_in_cb.fetch_add(1, Ordering::Relaxed) < 2 {
                    Some(now)
                } else {
                    None
                }
            }),
            Instant::now(),
        );

        // three rounds: two reschedules, then None
        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 3);
        assert_eq!(fired.load(Ordering::Relaxed), 3);
        assert!(queue.next_due().is_none());
    }

    #[test]
    fn future_timer_not_due_yet() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_cb = fired.clone();
        let _conn = queue.timer(
            Box::new(move |_| {
                fired_in_cb.fetch_add(1, Ordering::Relaxed);
                None
            }),
            Instant::now() + Duration::from_secs(3600),
        );

        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        assert!(queue.next_due().is_some());
    }

    #[test]
    fn disconnect_prevents_invocation() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_cb = fired.clone();
        let mut conn = queue.timer(
            Box::new(move |_| {
                fired_in_cb.fetch_add(1, Ordering::Relaxed);
                None
            }),
            Instant::now(),
        );

        conn.disconnect();
        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn rearm_supersedes_queued_deadline() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_cb = fired.clone();
        let conn = queue.timer(
            Box::new(move |_| {
                fired_in_cb.fetch_add(1, Ordering::Relaxed);
                None
            }),
            Instant::now(),
        );

        // push the deadline out; the already-queued entry must not fire
        conn.rearm(Instant::now() + Duration::from_secs(3600));
        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        assert!(conn.is_connected());

        // pull it back in
        conn.rearm(Instant::now());
        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 1);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn self_disconnect_releases_closure_only_after_return() {
        struct ReleaseProbe(Arc<AtomicUsize>);
        impl Drop for ReleaseProbe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let queue = queue();
        let released = Arc::new(AtomicUsize::new(0));
        let observed_during_callback = Arc::new(AtomicUsize::new(usize::MAX));

        let conn = Arc::new(Mutex::new(TimerConnection::default()));
        let probe = ReleaseProbe(released.clone());
        let conn_in_cb = conn.clone();
        let released_in_cb = released.clone();
        let observed = observed_during_callback.clone();
        *conn.lock().unwrap() = queue.timer(
            Box::new(move |_| {
                let _keep = &probe;
                conn_in_cb.lock().unwrap().disconnect();
                // the closure (and this probe) must still be alive here
                observed.store(released_in_cb.load(Ordering::Relaxed), Ordering::Relaxed);
                None
            }),
            Instant::now(),
        );

        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 1);
        assert_eq!(
            observed_during_callback.load(Ordering::Relaxed),
            0,
            "release hook ran before the callback returned"
        );
        assert_eq!(
            released.load(Ordering::Relaxed),
            1,
            "closure must be released once the invocation is over"
        );
        assert!(!conn.lock().unwrap().is_connected());
    }

    #[test]
    fn panicking_callback_surfaces_and_detaches() {
        let queue = queue();
        let _conn = queue.timer(Box::new(|_| panic!("timer boom")), Instant::now());

        let err = queue.run(Instant::now(), usize::MAX).unwrap_err();
        assert!(matches!(err, Error::CallbackFailed { .. }));
        assert_eq!(queue.run(Instant::now(), usize::MAX).unwrap(), 0);
    }
}

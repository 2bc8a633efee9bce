//! Async-safe triggered work.
//!
//! A registered async procedure can be triggered from any thread — and,
//! uniquely among this crate's operations, from a signal handler: a
//! trigger performs only atomic operations and at most one pipe write.
//!
//! Triggers coalesce. Each link carries an activation flag; the first
//! trigger after a dispatch sets it and pushes the link onto a lock-free
//! LIFO of pending activations, raising the dispatcher's wake-up flag if
//! the stack was empty. Further triggers while the flag is set are
//! no-ops. The dispatcher swaps the whole stack out at once and invokes
//! each pending procedure, clearing its activation flag first so that
//! triggers arriving during the invocation schedule another round.
//!
//! Disconnecting a link that is already pending does not remove it from
//! the stack (arbitrary threads cannot walk a lock-free LIFO safely);
//! the dispatcher reconciles the race by dropping the pending reference
//! in place of the invocation.
//!
//! Registration and disconnection are *not* async-signal-safe; only the
//! trigger is.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::connection::{Connection, Link};
use crate::error::{Error, Result};
use crate::eventflag::EventTrigger;
use crate::utils::Slab;

pub(crate) type AsyncWorkCallback = Box<dyn Fn() + Send + Sync>;

/// A registered async procedure.
pub(crate) struct AsyncWorkLink {
    function: AsyncWorkCallback,
    /// Coalescing flag: set between a trigger and the matching dispatch.
    activation: AtomicBool,
    /// Successor in the pending LIFO. Written by the pushing thread
    /// before publication, read by the draining thread after the swap.
    pending_next: AtomicPtr<AsyncWorkLink>,
    connected: AtomicBool,
    /// Immutable back-pointer; the queue's liveness is checked by
    /// upgrading, which keeps the trigger path lock-free.
    queue: Weak<AsyncWorkShared>,
    /// Cancellation gate guarding the registry slot.
    slot: Mutex<Option<usize>>,
}

impl AsyncWorkLink {
    /// Submit an activation. Safe to call from signal handlers.
    fn trigger(link: &Arc<AsyncWorkLink>) {
        if link.activation.swap(true, Ordering::AcqRel) {
            // already pending; coalesce
            return;
        }
        let Some(shared) = link.queue.upgrade() else {
            return;
        };

        // the pending stack owns one reference per queued activation
        let raw = Arc::into_raw(link.clone()) as *mut AsyncWorkLink;
        let mut head = shared.pending.load(Ordering::Relaxed);
        loop {
            unsafe { &*raw }.pending_next.store(head, Ordering::Relaxed);
            match shared.pending.compare_exchange_weak(
                head,
                raw,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        if head.is_null() {
            // empty -> non-empty transition: wake the dispatcher
            shared.trigger.set();
        }
    }
}

impl Link for AsyncWorkLink {
    fn disconnect(&self) {
        let mut gate = self.slot.lock().unwrap();
        let Some(slot) = gate.take() else {
            return;
        };
        self.connected.store(false, Ordering::Release);
        if let Some(shared) = self.queue.upgrade() {
            let registered = shared.registered.lock().unwrap().remove(slot);
            drop(gate);
            // the registry reference is dropped outside the registry
            // lock; if an activation is pending, the dispatcher holds
            // its own reference and reconciles at drain time
            drop(registered);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Handle to a registered async procedure.
#[derive(Clone, Default)]
pub struct AsyncSafeConnection {
    link: Option<Arc<AsyncWorkLink>>,
}

impl AsyncSafeConnection {
    fn new(link: Arc<AsyncWorkLink>) -> Self {
        AsyncSafeConnection { link: Some(link) }
    }

    /// Request an invocation of the procedure on a dispatching thread.
    ///
    /// Async-signal-safe. Invocations coalesce: after the last trigger
    /// returns, at least one invocation follows, but the number of
    /// invocations never exceeds the number of triggers.
    pub fn trigger(&self) {
        if let Some(link) = &self.link {
            AsyncWorkLink::trigger(link);
        }
    }

    /// Break the connection and drop this handle's reference to it.
    ///
    /// A pending activation is observed as zero further invocations.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect();
        }
    }

    /// Whether the procedure is still registered.
    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }
}

impl From<AsyncSafeConnection> for Connection {
    fn from(conn: AsyncSafeConnection) -> Self {
        match conn.link {
            Some(link) => Connection::new(link),
            None => Connection::default(),
        }
    }
}

pub(crate) struct AsyncWorkShared {
    /// Lock-free LIFO of pending activations.
    pending: AtomicPtr<AsyncWorkLink>,
    /// Registered procedures, addressable by slot for O(1) disconnect.
    registered: Mutex<Slab<Arc<AsyncWorkLink>>>,
    trigger: Arc<dyn EventTrigger>,
}

impl Drop for AsyncWorkShared {
    fn drop(&mut self) {
        // reclaim references still sitting in the pending stack
        let mut cur = self.pending.swap(ptr::null_mut(), Ordering::Acquire);
        while !cur.is_null() {
            let link = unsafe { Arc::from_raw(cur as *const AsyncWorkLink) };
            cur = link.pending_next.load(Ordering::Relaxed);
        }
    }
}

/// Dispatcher-side queue of async procedures.
pub(crate) struct AsyncWorkQueue {
    shared: Arc<AsyncWorkShared>,
}

impl AsyncWorkQueue {
    pub(crate) fn new(trigger: Arc<dyn EventTrigger>) -> Self {
        AsyncWorkQueue {
            shared: Arc::new(AsyncWorkShared {
                pending: AtomicPtr::new(ptr::null_mut()),
                registered: Mutex::new(Slab::new()),
                trigger,
            }),
        }
    }

    /// Register a procedure for async-safe triggering.
    pub(crate) fn async_procedure(&self, function: AsyncWorkCallback) -> AsyncSafeConnection {
        let link = Arc::new(AsyncWorkLink {
            function,
            activation: AtomicBool::new(false),
            pending_next: AtomicPtr::new(ptr::null_mut()),
            connected: AtomicBool::new(true),
            queue: Arc::downgrade(&self.shared),
            slot: Mutex::new(None),
        });
        let slot = self.shared.registered.lock().unwrap().insert(link.clone());
        *link.slot.lock().unwrap() = Some(slot);
        AsyncSafeConnection::new(link)
    }

    /// Whether any activation is pending.
    pub(crate) fn pending(&self) -> bool {
        !self.shared.pending.load(Ordering::Relaxed).is_null()
    }

    /// Drain and invoke pending activations, in submission-reversed
    /// order.
    ///
    /// If a procedure panics, activations drained but not yet processed
    /// are pushed back, the wake-up flag is re-raised, and the panic
    /// surfaces as [`Error::CallbackFailed`]; procedures already invoked
    /// in this round are not invoked again.
    pub(crate) fn dispatch(&self) -> Result<usize> {
        if !self.pending() {
            return Ok(0);
        }

        let mut drain = DrainGuard {
            head: self.shared.pending.swap(ptr::null_mut(), Ordering::Acquire),
            shared: &self.shared,
        };

        let mut handled = 0;
        while !drain.head.is_null() {
            let link = unsafe { Arc::from_raw(drain.head as *const AsyncWorkLink) };
            drain.head = link.pending_next.load(Ordering::Relaxed);

            if link.is_connected() {
                // Clear before invoking: a trigger that lands during the
                // invocation must schedule another round.
                link.activation.store(false, Ordering::Release);
                let outcome = catch_unwind(AssertUnwindSafe(|| (link.function)()));
                if let Err(payload) = outcome {
                    log::error!("async procedure panicked; remaining activations re-queued");
                    return Err(Error::callback_failed(payload));
                }
                handled += 1;
            }
            // disconnected link: dropping the Arc releases the pending
            // reference in place of the invocation
        }

        Ok(handled)
    }
}

impl Drop for AsyncWorkQueue {
    fn drop(&mut self) {
        loop {
            let link = self.shared.registered.lock().unwrap().pop_any();
            match link {
                Some(link) => link.disconnect(),
                None => break,
            }
        }
    }
}

/// Re-queues unconsumed activations if the drain is cut short.
struct DrainGuard<'a> {
    head: *mut AsyncWorkLink,
    shared: &'a AsyncWorkShared,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.head.is_null() {
            return;
        }
        let mut last = self.head;
        loop {
            let next = unsafe { &*last }.pending_next.load(Ordering::Relaxed);
            if next.is_null() {
                break;
            }
            last = next;
        }
        let mut head = self.shared.pending.load(Ordering::Relaxed);
        loop {
            unsafe { &*last }.pending_next.store(head, Ordering::Relaxed);
            match self.shared.pending.compare_exchange_weak(
                head,
                self.head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        self.shared.trigger.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventflag::{CondvarEventFlag, EventFlag};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        flag: Arc<CondvarEventFlag>,
        queue: AsyncWorkQueue,
        called: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let flag = Arc::new(CondvarEventFlag::new());
            let queue = AsyncWorkQueue::new(flag.clone());
            Fixture {
                flag,
                queue,
                called: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn counting_procedure(&self) -> AsyncSafeConnection {
            let called = self.called.clone();
            self.queue.async_procedure(Box::new(move || {
                called.fetch_add(1, Ordering::Relaxed);
            }))
        }
    }

    fn link_refcount(conn: &AsyncSafeConnection) -> usize {
        Arc::strong_count(conn.link.as_ref().expect("connection still holds its link"))
    }

    #[test]
    fn create_gives_two_references() {
        let fx = Fixture::new();
        let conn = fx.counting_procedure();
        // one for the handle, one for the registry
        assert_eq!(link_refcount(&conn), 2);
    }

    #[test]
    fn trigger_dispatch_invokes_once() {
        let fx = Fixture::new();
        let conn = fx.counting_procedure();

        conn.trigger();
        assert_eq!(link_refcount(&conn), 3, "pending stack holds a reference");
        assert!(fx.queue.pending());

        fx.flag.clear();
        assert_eq!(fx.queue.dispatch().unwrap(), 1);
        assert_eq!(fx.called.load(Ordering::Relaxed), 1);
        assert_eq!(link_refcount(&conn), 2, "pending reference released");
    }

    #[test]
    fn triggers_coalesce() {
        let fx = Fixture::new();
        let conn = fx.counting_procedure();

        conn.trigger();
        conn.trigger();
        conn.trigger();
        assert_eq!(link_refcount(&conn), 3, "coalesced triggers enqueue once");

        assert_eq!(fx.queue.dispatch().unwrap(), 1);
        assert_eq!(fx.called.load(Ordering::Relaxed), 1);

        // triggerable again after dispatch
        conn.trigger();
        assert_eq!(fx.queue.dispatch().unwrap(), 1);
        assert_eq!(fx.called.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn disconnect_after_trigger_reconciled_at_dispatch() {
        let fx = Fixture::new();
        let mut conn = fx.counting_procedure();
        let probe = conn.clone();

        conn.trigger();
        conn.disconnect();
        assert!(fx.queue.pending(), "pending entry survives the disconnect");
        assert_eq!(
            link_refcount(&probe),
            2,
            "registry reference dropped, pending reference kept"
        );

        assert_eq!(fx.queue.dispatch().unwrap(), 0);
        assert_eq!(fx.called.load(Ordering::Relaxed), 0, "no invocation after disconnect");
        assert!(!fx.queue.pending());
        assert_eq!(link_refcount(&probe), 1, "only the probe handle remains");
    }

    #[test]
    fn panic_requeues_remainder_and_reraises_flag() {
        let fx = Fixture::new();

        let called = fx.called.clone();
        let c1 = fx.queue.async_procedure(Box::new(move || {
            called.fetch_add(1, Ordering::Relaxed);
            panic!("async boom");
        }));
        let called = fx.called.clone();
        let c2 = fx.queue.async_procedure(Box::new(move || {
            called.fetch_add(1, Ordering::Relaxed);
            panic!("async boom");
        }));

        c1.trigger();
        c2.trigger();
        assert!(fx.flag.is_set());

        fx.flag.clear();
        let err = fx.queue.dispatch().unwrap_err();
        assert!(matches!(err, Error::CallbackFailed { .. }));
        assert_eq!(fx.called.load(Ordering::Relaxed), 1, "first procedure ran");
        assert!(
            fx.flag.is_set(),
            "flag must be re-raised for the re-queued remainder"
        );
        assert!(fx.queue.pending());

        fx.flag.clear();
        let err = fx.queue.dispatch().unwrap_err();
        assert!(matches!(err, Error::CallbackFailed { .. }));
        assert_eq!(fx.called.load(Ordering::Relaxed), 2, "second procedure ran");
        assert!(!fx.flag.is_set(), "nothing left to dispatch");
        assert!(!fx.queue.pending());
    }

    #[test]
    fn queue_drop_reclaims_pending_references() {
        let fx = Fixture::new();
        let conn = fx.counting_procedure();
        conn.trigger();
        assert_eq!(link_refcount(&conn), 3);

        drop(fx.queue);
        assert_eq!(
            link_refcount(&conn),
            1,
            "registry and pending references reclaimed at shutdown"
        );
        assert!(!conn.is_connected());
    }
}

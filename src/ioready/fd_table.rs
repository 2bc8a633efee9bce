//! Per-descriptor callback registry.
//!
//! The table maps file descriptors to chains of registered callback
//! links. It is the shared mutable heart of the dispatcher and is built
//! so that the reader side (event delivery) runs without any lock:
//!
//! - readers traverse the per-chain `active` list through atomic
//!   `active_next` pointers,
//! - writers (insert/remove/modify) run serialized under the write side
//!   of the dispatcher's deferred lock and only perform mutations that
//!   preserve what concurrent readers rely on: links are never unlinked
//!   from the full list, forward pointers never dangle,
//! - removal only *hides* a link from the active view and pushes it onto
//!   the `inactive` chain; the actual unlink and the release of the
//!   registry's reference happen in [`FdTable::synchronize`], which the
//!   deferred lock guarantees runs without concurrent readers or
//!   writers.
//!
//! Each link therefore moves through the states: not-yet-inserted →
//! active → inactive (hidden, awaiting synchronize) → reclaimed.
//!
//! Descriptor reuse is guarded by cookies: when the last callback for a
//! descriptor is removed, the user program may close and reuse the fd
//! immediately, and a stale readiness event for the old descriptor could
//! be misdelivered to the new chain. Removing the last link bumps a
//! global cookie and stamps it into the chain; events carrying an older
//! cookie are dropped.

use std::cell::{Cell, UnsafeCell};
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::connection::Link;
use crate::ioready::dispatcher::DispatcherInner;
use crate::ioready::{IoReadyCallback, IoReadyEvents};

/// A registered I/O readiness callback.
///
/// The chain holds one reference (minted at insert, reclaimed at
/// synchronize), every connection handle holds one, and the dispatcher
/// briefly holds the chain's one while invoking. The callback closure is
/// dropped at reclaim time, not when the last handle goes away.
pub(crate) struct IoLink {
    /// The user callback. Invoked only under the read side; cleared only
    /// during delayed release, when no reader can be active.
    function: UnsafeCell<Option<IoReadyCallback>>,
    /// Successor in the reader-visible active list.
    active_next: AtomicPtr<IoLink>,
    /// Neighbours in the full per-fd list. Writer-side only.
    prev: Cell<*const IoLink>,
    next: Cell<*const IoLink>,
    /// Successor in the deferred-removal chain. Writer-side only.
    inactive_next: Cell<*const IoLink>,
    fd: RawFd,
    /// Watched event mask, readable concurrently with modification.
    mask: AtomicU32,
    connected: AtomicBool,
    /// Back-pointer to the owning dispatcher. The mutex is the one-shot
    /// cancellation gate: disconnect takes the weak reference out under
    /// it, so a second disconnect (or a racing modify) observes `None`.
    service: Mutex<Option<Weak<DispatcherInner>>>,
}

// Safety: the raw list pointers and the closure cell are governed by the
// dispatcher's deferred lock protocol described in the module docs; all
// remaining fields are atomics or locks.
unsafe impl Send for IoLink {}
unsafe impl Sync for IoLink {}

impl IoLink {
    pub(crate) fn new(
        function: IoReadyCallback,
        fd: RawFd,
        mask: IoReadyEvents,
        service: Weak<DispatcherInner>,
    ) -> Self {
        IoLink {
            function: UnsafeCell::new(Some(function)),
            active_next: AtomicPtr::new(ptr::null_mut()),
            prev: Cell::new(ptr::null()),
            next: Cell::new(ptr::null()),
            inactive_next: Cell::new(ptr::null()),
            fd,
            mask: AtomicU32::new(mask.bits()),
            connected: AtomicBool::new(true),
            service: Mutex::new(Some(service)),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn event_mask(&self) -> IoReadyEvents {
        IoReadyEvents::from_bits_truncate(self.mask.load(Ordering::Relaxed))
    }

    pub(crate) fn set_event_mask(&self, mask: IoReadyEvents) {
        self.mask.store(mask.bits(), Ordering::Relaxed);
    }

    pub(crate) fn modify(&self, events: IoReadyEvents) {
        let events = events.normalize();
        let gate = self.service.lock().unwrap();
        if let Some(service) = gate.as_ref().and_then(Weak::upgrade) {
            service.modify_link(self, events);
        }
    }

    /// Invoke the callback. Must run under the read side of the
    /// dispatcher's deferred lock; the closure cannot disappear while any
    /// reader is active.
    fn invoke(&self, events: IoReadyEvents) {
        if let Some(function) = unsafe { (*self.function.get()).as_ref() } {
            function(events);
        }
    }

    /// Drop the callback closure. Must only run from delayed release,
    /// outside all locks and with no concurrent reader.
    fn clear_function(&self) {
        unsafe {
            *self.function.get() = None;
        }
    }

    pub(crate) fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn abandon(&self) {
        self.service.lock().unwrap().take();
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Link for IoLink {
    fn disconnect(&self) {
        let mut gate = self.service.lock().unwrap();
        match gate.take().and_then(|weak| weak.upgrade()) {
            Some(service) => service.remove_link(self, gate),
            None => {}
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

struct Chain {
    /// Head of the reader-visible list.
    active: AtomicPtr<IoLink>,
    /// Head and tail of the full list. Writer-side only.
    first: Cell<*const IoLink>,
    last: Cell<*const IoLink>,
    /// Descriptor-reuse cookie; events older than this are dropped.
    cookie: AtomicU32,
}

impl Chain {
    fn new() -> Self {
        Chain {
            active: AtomicPtr::new(ptr::null_mut()),
            first: Cell::new(ptr::null()),
            last: Cell::new(ptr::null()),
            cookie: AtomicU32::new(0),
        }
    }

    fn compute_event_mask(&self) -> IoReadyEvents {
        let mut mask = IoReadyEvents::empty();
        let mut cur = self.active.load(Ordering::Relaxed) as *const IoLink;
        while !cur.is_null() {
            let link = unsafe { &*cur };
            mask |= link.event_mask();
            cur = link.active_next.load(Ordering::Relaxed) as *const IoLink;
        }
        mask
    }
}

struct Table {
    entries: Box<[AtomicPtr<Chain>]>,
    /// Superseded smaller table, freed at the next synchronize.
    old: Cell<*mut Table>,
}

impl Table {
    fn with_capacity(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Table {
            entries,
            old: Cell::new(ptr::null_mut()),
        }
    }
}

/// Handler table for file descriptor events.
///
/// Concurrency contract (enforced by the dispatcher, not by this type):
/// - `notify` and `disconnect_all` run under the read side,
/// - `insert`, `remove`, `modify_mask` run under the write side,
/// - `synchronize` runs in the synchronizing state, excluding everything
///   else.
pub(crate) struct FdTable {
    table: AtomicPtr<Table>,
    /// Head of the deferred-removal chain. Writer-side only.
    inactive: Cell<*const IoLink>,
    cookie: AtomicU32,
    need_cookie_sync: Cell<bool>,
}

// Safety: see the concurrency contract above; every field is either
// atomic or only touched by the serialized writer/synchronizer.
unsafe impl Send for FdTable {}
unsafe impl Sync for FdTable {}

impl FdTable {
    pub(crate) fn new(initial: usize) -> Self {
        let table = Box::into_raw(Box::new(Table::with_capacity(initial.max(1))));
        FdTable {
            table: AtomicPtr::new(table),
            inactive: Cell::new(ptr::null()),
            cookie: AtomicU32::new(0),
            need_cookie_sync: Cell::new(false),
        }
    }

    /// The cookie to pass along with events fetched *after* this call.
    pub(crate) fn cookie(&self) -> u32 {
        self.cookie.load(Ordering::Relaxed)
    }

    /// Register a link, acquiring a registry reference to it.
    ///
    /// Returns the effective event mask of the descriptor before and
    /// after the insertion, for reprogramming the backend.
    pub(crate) fn insert(&self, link: &Arc<IoLink>) -> (IoReadyEvents, IoReadyEvents) {
        let chain = self.get_create_chain(link.fd);

        // registry reference, handed back by synchronize()
        let raw = Arc::into_raw(link.clone());

        let old_mask = chain.compute_event_mask();
        let new_mask = old_mask | link.event_mask();

        link.prev.set(chain.last.get());
        link.next.set(ptr::null());
        link.active_next.store(ptr::null_mut(), Ordering::Relaxed);

        // Publish the fully initialized element once, then link it in
        // with relaxed stores.
        fence(Ordering::Release);

        // Append to the active view. Elements at the tail of the full
        // list that are already hidden from the active view terminate it
        // early; they must forward to the new element so that readers
        // parked on them keep seeing the remainder of the chain.
        let mut tail = chain.last.get();
        loop {
            if tail.is_null() {
                if chain.active.load(Ordering::Relaxed).is_null() {
                    chain.active.store(raw as *mut IoLink, Ordering::Relaxed);
                }
                break;
            }
            let element = unsafe { &*tail };
            if !element.active_next.load(Ordering::Relaxed).is_null() {
                break;
            }
            element.active_next.store(raw as *mut IoLink, Ordering::Relaxed);
            tail = element.prev.get();
        }

        // append to the full list
        if chain.last.get().is_null() {
            chain.first.set(raw);
        } else {
            unsafe { &*chain.last.get() }.next.set(raw);
        }
        chain.last.set(raw);

        (old_mask, new_mask)
    }

    /// Hide a link from the active view and stage it for reclamation.
    ///
    /// Returns the effective event mask before and after the removal.
    pub(crate) fn remove(&self, link: &IoLink) -> (IoReadyEvents, IoReadyEvents) {
        let chain = self
            .get_chain(link.fd)
            .expect("removing a link that was never inserted");

        let link_ptr = link as *const IoLink;
        let next_active = link.active_next.load(Ordering::Relaxed);

        // Every predecessor whose active_next points at us must skip to
        // our successor, so readers parked anywhere before this element
        // no longer step into it.
        let mut tail = link.prev.get();
        loop {
            if tail.is_null() {
                if chain.active.load(Ordering::Relaxed) as *const IoLink == link_ptr {
                    chain.active.store(next_active, Ordering::Release);
                }
                break;
            }
            let element = unsafe { &*tail };
            if element.active_next.load(Ordering::Relaxed) as *const IoLink != link_ptr {
                break;
            }
            element.active_next.store(next_active, Ordering::Release);
            tail = element.prev.get();
        }

        let new_mask = chain.compute_event_mask();
        let old_mask = new_mask | link.event_mask();

        // Last callback gone: the program may close and reuse the fd at
        // any moment, so invalidate events already fetched for it.
        if chain.active.load(Ordering::Relaxed).is_null() {
            let old_cookie = self.cookie.fetch_add(1, Ordering::Relaxed);
            let new_cookie = old_cookie.wrapping_add(1);
            chain.cookie.store(new_cookie, Ordering::Relaxed);
            if ((old_cookie ^ new_cookie) & (1 << 16)) != 0 {
                self.need_cookie_sync.set(true);
            }
        }

        link.inactive_next.set(self.inactive.get());
        self.inactive.set(link_ptr);

        (old_mask, new_mask)
    }

    /// Change a link's event mask.
    ///
    /// Returns the effective event mask before and after the change.
    pub(crate) fn modify_mask(
        &self,
        link: &IoLink,
        mask: IoReadyEvents,
    ) -> (IoReadyEvents, IoReadyEvents) {
        let chain = self
            .get_chain(link.fd)
            .expect("modifying a link that was never inserted");
        let old_mask = chain.compute_event_mask();
        link.set_event_mask(mask);
        let new_mask = chain.compute_event_mask();
        (old_mask, new_mask)
    }

    /// Deliver `events` on `fd` to every matching active callback.
    ///
    /// `call_cookie` must have been obtained via [`Self::cookie`] before
    /// the events were fetched from the backend; events predating a
    /// descriptor-reuse boundary are dropped.
    pub(crate) fn notify(&self, fd: RawFd, events: IoReadyEvents, call_cookie: u32) {
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        let index = fd as usize;
        if index >= table.entries.len() {
            return;
        }
        let chain = table.entries[index].load(Ordering::Acquire);
        if chain.is_null() {
            return;
        }
        let chain = unsafe { &*chain };

        let delta = chain.cookie.load(Ordering::Relaxed).wrapping_sub(call_cookie) as i32;
        if delta > 0 {
            return;
        }

        let mut cur = chain.active.load(Ordering::Acquire) as *const IoLink;
        while !cur.is_null() {
            let link = unsafe { &*cur };
            let matched = events & link.event_mask();
            if !matched.is_empty() {
                link.invoke(matched);
            }
            cur = link.active_next.load(Ordering::Acquire) as *const IoLink;
        }
    }

    /// Disconnect every registered link. Runs under the read side; the
    /// disconnects stage removals that the caller's read unlock commits.
    pub(crate) fn disconnect_all(&self) -> bool {
        let mut any = false;
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        for entry in table.entries.iter() {
            let chain = entry.load(Ordering::Acquire);
            if chain.is_null() {
                continue;
            }
            let chain = unsafe { &*chain };
            loop {
                let link = chain.active.load(Ordering::Acquire);
                if link.is_null() {
                    break;
                }
                any = true;
                unsafe { &*link }.disconnect();
            }
        }
        any
    }

    /// Commit staged removals. Runs in the synchronizing state.
    ///
    /// Unlinks every staged link from its full list and returns them as
    /// a [`DelayedRelease`]; dropping that object (outside all locks)
    /// drops the closures and the registry references.
    pub(crate) fn synchronize(&self) -> DelayedRelease {
        self.deallocate_old_tables();
        let table = unsafe { &*self.table.load(Ordering::Relaxed) };

        let mut cur = self.inactive.get();
        while !cur.is_null() {
            let link = unsafe { &*cur };
            let chain = unsafe { &*table.entries[link.fd as usize].load(Ordering::Relaxed) };
            if link.prev.get().is_null() {
                chain.first.set(link.next.get());
            } else {
                unsafe { &*link.prev.get() }.next.set(link.next.get());
            }
            if link.next.get().is_null() {
                chain.last.set(link.prev.get());
            } else {
                unsafe { &*link.next.get() }.prev.set(link.prev.get());
            }
            cur = link.inactive_next.get();
        }

        if self.need_cookie_sync.replace(false) {
            // The global cookie crossed a half-range boundary; restamp
            // all chains so the wrapping comparison in notify stays
            // well-ordered.
            let current = self.cookie.load(Ordering::Relaxed);
            for entry in table.entries.iter() {
                let chain = entry.load(Ordering::Relaxed);
                if !chain.is_null() {
                    unsafe { &*chain }.cookie.store(current, Ordering::Relaxed);
                }
            }
        }

        DelayedRelease {
            head: self.inactive.replace(ptr::null()),
        }
    }

    fn get_chain(&self, fd: RawFd) -> Option<&Chain> {
        let table = unsafe { &*self.table.load(Ordering::Relaxed) };
        let index = fd as usize;
        if index >= table.entries.len() {
            return None;
        }
        let chain = table.entries[index].load(Ordering::Relaxed);
        if chain.is_null() {
            None
        } else {
            Some(unsafe { &*chain })
        }
    }

    fn get_create_chain(&self, fd: RawFd) -> &Chain {
        assert!(fd >= 0, "cannot watch a negative file descriptor");
        let index = fd as usize;

        let mut table = unsafe { &*self.table.load(Ordering::Relaxed) };
        if index >= table.entries.len() {
            table = self.extend_table(index + 1);
        }

        let chain = table.entries[index].load(Ordering::Relaxed);
        if chain.is_null() {
            let chain = Box::into_raw(Box::new(Chain::new()));
            table.entries[index].store(chain, Ordering::Release);
            unsafe { &*chain }
        } else {
            unsafe { &*chain }
        }
    }

    fn extend_table(&self, required: usize) -> &Table {
        let old = self.table.load(Ordering::Relaxed);
        let old_ref = unsafe { &*old };
        let capacity = (old_ref.entries.len() * 2).max(required);
        let new_table = Table::with_capacity(capacity);
        for (n, entry) in old_ref.entries.iter().enumerate() {
            new_table.entries[n].store(entry.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        new_table.old.set(old);
        let new_table = Box::into_raw(Box::new(new_table));
        self.table.store(new_table, Ordering::Release);
        unsafe { &*new_table }
    }

    fn deallocate_old_tables(&self) {
        let table = unsafe { &*self.table.load(Ordering::Relaxed) };
        let mut old = table.old.replace(ptr::null_mut());
        while !old.is_null() {
            let boxed = unsafe { Box::from_raw(old) };
            old = boxed.old.get();
        }
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        // The owner disconnects and synchronizes everything before the
        // table is dropped; only empty chains and table storage remain.
        debug_assert!(self.inactive.get().is_null());
        let mut table = self.table.load(Ordering::Relaxed);
        let mut newest = true;
        while !table.is_null() {
            let boxed = unsafe { Box::from_raw(table) };
            if newest {
                for entry in boxed.entries.iter() {
                    let chain = entry.load(Ordering::Relaxed);
                    if !chain.is_null() {
                        drop(unsafe { Box::from_raw(chain) });
                    }
                }
                newest = false;
            }
            table = boxed.old.get();
        }
    }
}

/// Links removed from the registry, awaiting their final release.
///
/// Dropping this object drops each link's closure and the registry's
/// reference. It must be dropped outside the dispatcher's locks: closure
/// destructors are user code and may re-enter the dispatcher.
pub(crate) struct DelayedRelease {
    head: *const IoLink,
}

// Safety: the links in the chain are exclusively owned by this object;
// the registry no longer reaches them.
unsafe impl Send for DelayedRelease {}

impl Drop for DelayedRelease {
    fn drop(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            let link = unsafe { Arc::from_raw(cur) };
            cur = link.inactive_next.get();
            link.clear_function();
        }
    }
}

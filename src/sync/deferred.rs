//! Deferred reader/writer synchronization.
//!
//! A [`DeferrableRwLock`] lets readers and writers make progress without
//! ever blocking each other: writers stage their modifications into data
//! structures that tolerate deferred visibility, and the destructive part
//! of a modification (the *commit*, or synchronize step) runs at the
//! unique moment when no reader and no other writer is active.
//!
//! Responsibilities of the protocol:
//! - readers never wait for writers; a read lock is one atomic
//!   compare-and-increment in the common case,
//! - writers never spin waiting for readers; if readers are present the
//!   writer records its intent and returns,
//! - the commit runs exactly once per batch of staged changes, performed
//!   either by the sole writer (no readers were present) or by the last
//!   departing reader.
//!
//! Which party must commit is communicated through the guard objects:
//! whoever ends up holding a [`SyncGuard`] is in the *synchronizing*
//! state and owns the commit. While a `SyncGuard` exists, every other
//! reader and writer blocks, so the commit must be short and must not
//! call back into user code. The reader count is biased by one so that a
//! deferred writer can remove the bias and have the last reader observe
//! the zero crossing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Default)]
struct State {
    /// A writer has staged changes that still await the commit step.
    queued: bool,
    /// A synchronous writer is parked on the condition variable.
    waiting: bool,
}

pub(crate) struct DeferrableRwLock {
    /// Reader count, biased by one. The bias is held by the lock itself
    /// and removed by a writer; `0` therefore means "a writer owns the
    /// commit right now or is waiting for the last reader".
    readers: AtomicUsize,
    state: Mutex<State>,
    waiting_writers: Condvar,
}

impl DeferrableRwLock {
    pub(crate) fn new() -> Self {
        DeferrableRwLock {
            readers: AtomicUsize::new(1),
            state: Mutex::new(State::default()),
            waiting_writers: Condvar::new(),
        }
    }

    /// Acquire a read lock.
    ///
    /// `None` means the lock was acquired and the caller may proceed;
    /// release with [`Self::read_unlock`]. `Some(guard)` means the caller
    /// must perform the commit step, finish the guard, and then retry
    /// `read_lock`.
    #[must_use]
    pub(crate) fn read_lock(&self) -> Option<SyncGuard<'_>> {
        if self.read_acquire() {
            None
        } else {
            self.read_lock_slow()
        }
    }

    /// Release a read lock.
    ///
    /// `Some(guard)` means this was the last reader and a writer left
    /// staged changes behind: the caller must perform the commit step and
    /// finish the guard.
    #[must_use]
    pub(crate) fn read_unlock(&self) -> Option<SyncGuard<'_>> {
        if self.readers.fetch_sub(1, Ordering::Release) != 1 {
            None
        } else {
            self.read_unlock_slow()
        }
    }

    /// Acquire the write lock without ever waiting for readers.
    ///
    /// If no readers were active the returned guard reports
    /// [`WriteGuard::is_sync`] and the caller owns the commit: apply the
    /// staged changes and consume the guard via [`WriteGuard::into_sync`].
    /// Otherwise the changes stay staged; dropping the guard releases the
    /// writer side and a later `read_unlock` will hand the commit to the
    /// last departing reader.
    pub(crate) fn write_lock_async(&self) -> WriteGuard<'_> {
        let mut state = self.state.lock().unwrap();
        let mut sync = false;
        if !state.queued && !state.waiting {
            sync = self.readers.fetch_sub(1, Ordering::Acquire) == 1;
        }
        state.queued = true;
        WriteGuard {
            lock: self,
            state: Some(state),
            sync,
        }
    }

    /// Acquire the write lock, blocking until all readers have left.
    ///
    /// Used only at shutdown to wait out a concurrent dispatch before the
    /// registry is torn down. The returned guard is in the synchronizing
    /// state.
    pub(crate) fn write_lock_sync(&self) -> SyncGuard<'_> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.queued && !state.waiting && self.readers.fetch_sub(1, Ordering::Acquire) == 1
            {
                return SyncGuard {
                    lock: self,
                    state: Some(state),
                };
            }
            state.waiting = true;
            state = self.waiting_writers.wait(state).unwrap();
        }
    }

    fn read_acquire(&self) -> bool {
        let mut expected = self.readers.load(Ordering::Relaxed);
        loop {
            if expected == 0 {
                return false;
            }
            match self.readers.compare_exchange_weak(
                expected,
                expected + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => expected = observed,
            }
        }
    }

    fn read_lock_slow(&self) -> Option<SyncGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        state = self.wake_waiting_writers(state);
        if self.read_acquire() {
            return None;
        }
        Some(SyncGuard {
            lock: self,
            state: Some(state),
        })
    }

    fn read_unlock_slow(&self) -> Option<SyncGuard<'_>> {
        let state = self.state.lock().unwrap();
        let state = self.wake_waiting_writers(state);
        // If another thread observed the 1 -> 0 transition it serializes
        // with us on the state mutex; a 0 -> 1 transition only happens
        // with the mutex held, so the mutex ordering suffices here.
        if self.readers.load(Ordering::Relaxed) != 0 {
            return None;
        }
        Some(SyncGuard {
            lock: self,
            state: Some(state),
        })
    }

    fn wake_waiting_writers<'a>(&'a self, mut state: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        while state.waiting {
            state.waiting = false;
            drop(state);
            self.waiting_writers.notify_all();
            state = self.state.lock().unwrap();
        }
        state
    }
}

/// Writer-side guard returned by [`DeferrableRwLock::write_lock_async`].
///
/// The guard keeps the writer side locked; registry mutations must happen
/// while it is held.
pub(crate) struct WriteGuard<'a> {
    lock: &'a DeferrableRwLock,
    state: Option<MutexGuard<'a, State>>,
    sync: bool,
}

impl<'a> WriteGuard<'a> {
    /// Whether the lock was acquired synchronously (no readers active).
    pub(crate) fn is_sync(&self) -> bool {
        self.sync
    }

    /// Convert into the synchronizing state.
    ///
    /// Returns `Some` exactly when [`Self::is_sync`]: the caller must run
    /// the commit step and finish the returned guard. Returns `None`
    /// after releasing the writer side; the commit is then owed by the
    /// last departing reader.
    pub(crate) fn into_sync(mut self) -> Option<SyncGuard<'a>> {
        let state = self.state.take();
        if self.sync {
            Some(SyncGuard {
                lock: self.lock,
                state,
            })
        } else {
            None
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            if self.sync {
                // Not converted into a SyncGuard (early exit): leave the
                // lock usable again rather than wedged in sync state.
                state.queued = false;
                state.waiting = false;
                self.lock.readers.fetch_add(1, Ordering::Release);
            }
            // unlocking the state mutex is the async write unlock
        }
    }
}

/// The synchronizing state: sole access to the protected structures.
///
/// Dropping (or [`finish`](Self::finish)ing) the guard marks the staged
/// batch committed and reopens the lock: the reader bias is restored with
/// release ordering, which is what publishes the commit to the next
/// reader.
pub(crate) struct SyncGuard<'a> {
    lock: &'a DeferrableRwLock,
    state: Option<MutexGuard<'a, State>>,
}

impl SyncGuard<'_> {
    pub(crate) fn finish(self) {}
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.queued = false;
            state.waiting = false;
            self.lock.readers.fetch_add(1, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn nested_readers_and_deferred_writer() {
        let lock = DeferrableRwLock::new();

        // plain nested readers: no synchronization required anywhere
        assert!(lock.read_lock().is_none());
        assert!(lock.read_lock().is_none());
        assert!(lock.read_unlock().is_none());
        assert!(lock.read_unlock().is_none());

        // a writer with no readers gets the commit synchronously
        let guard = lock.write_lock_async();
        assert!(guard.is_sync());
        let sync = guard.into_sync().expect("sync writer owns the commit");
        sync.finish();

        // a writer racing a reader defers; the reader inherits the commit
        assert!(lock.read_lock().is_none());
        let guard = lock.write_lock_async();
        assert!(!guard.is_sync());
        assert!(guard.into_sync().is_none());
        let sync = lock
            .read_unlock()
            .expect("last reader must observe the queued commit");
        sync.finish();

        // the lock is fully reusable afterwards
        assert!(lock.read_lock().is_none());
        assert!(lock.read_unlock().is_none());
    }

    #[test]
    fn first_reader_after_deferred_writer_inherits_commit() {
        let lock = DeferrableRwLock::new();

        assert!(lock.read_lock().is_none());
        assert!(lock.write_lock_async().into_sync().is_none());
        let sync = lock.read_unlock().expect("commit owed to last reader");
        drop(sync);

        // after the commit the lock behaves normally again
        assert!(lock.read_lock().is_none());
        assert!(lock.read_unlock().is_none());
    }

    #[test]
    fn write_lock_sync_waits_for_reader() {
        let lock = Arc::new(DeferrableRwLock::new());
        let reader_done = Arc::new(AtomicBool::new(false));

        assert!(lock.read_lock().is_none());

        let writer = {
            let lock = lock.clone();
            let reader_done = reader_done.clone();
            thread::spawn(move || {
                let sync = lock.write_lock_sync();
                assert!(
                    reader_done.load(Ordering::Relaxed),
                    "sync writer ran while a reader was still active"
                );
                sync.finish();
            })
        };

        thread::sleep(Duration::from_millis(50));
        reader_done.store(true, Ordering::Relaxed);
        if let Some(sync) = lock.read_unlock() {
            sync.finish();
        }

        writer.join().unwrap();

        // lock usable after the synchronous writer released it
        assert!(lock.read_lock().is_none());
        assert!(lock.read_unlock().is_none());
    }
}

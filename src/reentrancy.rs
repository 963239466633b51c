//! Debug-only detection of self-deadlocking bucket acquisitions.
//!
//! Bucket locks are not reentrant for exclusive access: a thread that holds
//! any lock on a bucket and then asks for exclusive access to it (or holds
//! exclusive access and asks for shared access) blocks forever. In debug
//! builds every acquired bucket lock is recorded per thread and such a
//! request panics before it can block. In release builds this compiles to a
//! zero-cost no-op.

use crate::bucket::Mode;
use core::marker::PhantomData;

#[cfg(debug_assertions)]
use core::cell::RefCell;

#[cfg(debug_assertions)]
thread_local! {
    static HELD: RefCell<Vec<(usize, Mode)>> = const { RefCell::new(Vec::new()) };
}

/// Record of one bucket lock held by the current thread. Removed on drop.
#[derive(Debug)]
pub struct HeldLock {
    #[cfg(debug_assertions)]
    addr: usize,
    #[cfg(debug_assertions)]
    mode: Mode,
    // Records live in a thread-local; keep !Send + !Sync.
    _nosend: PhantomData<*mut ()>,
}

impl HeldLock {
    /// Register a lock about to be acquired in `mode`. In debug builds,
    /// panics if the current thread already holds a conflicting lock on the
    /// same bucket.
    #[inline]
    #[track_caller]
    pub fn enter(addr: usize, mode: Mode) -> Self {
        #[cfg(debug_assertions)]
        HELD.with(|held| {
            let conflict = held
                .borrow()
                .iter()
                .any(|&(a, m)| a == addr && (m == Mode::Exclusive || mode == Mode::Exclusive));
            assert!(
                !conflict,
                "deadlock detected: bucket is already locked by this thread"
            );
        });
        Self::record(addr, mode)
    }

    /// Register a lock that was already acquired without blocking.
    #[inline]
    pub fn record(addr: usize, mode: Mode) -> Self {
        #[cfg(debug_assertions)]
        {
            HELD.with(|held| held.borrow_mut().push((addr, mode)));
            Self {
                addr,
                mode,
                _nosend: PhantomData,
            }
        }

        #[cfg(not(debug_assertions))]
        {
            let _ = (addr, mode);
            Self {
                _nosend: PhantomData,
            }
        }
    }

    /// The lock was downgraded from exclusive to shared.
    #[inline]
    pub fn downgrade(&mut self) {
        #[cfg(debug_assertions)]
        {
            let (addr, old) = (self.addr, self.mode);
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(rec) = held.iter_mut().rev().find(|r| **r == (addr, old)) {
                    rec.1 = Mode::Shared;
                }
            });
            self.mode = Mode::Shared;
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let rec = (self.addr, self.mode);
            // try_with: the thread-local may already be gone during thread teardown.
            let _ = HELD.try_with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held.iter().rposition(|r| *r == rec) {
                    held.swap_remove(pos);
                }
            });
        }
    }
}

//! Buckets: a raw reader/writer lock guarding an ordered chain of entries.

use crate::error::ReserveError;
use crate::reentrancy::HeldLock;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use parking_lot::lock_api::{RawRwLock as _, RawRwLockDowngrade as _, RawRwLockRecursive as _};
use parking_lot::RawRwLock;

/// Lock mode of a bucket acquisition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Shared,
    Exclusive,
}

#[derive(Clone, Debug)]
pub struct Entry<K, V> {
    pub hash: u64,
    /// Position in the bucket's insertion order; strictly increasing along the chain.
    pub stamp: u64,
    pub key: K,
    pub value: V,
}

/// Entries of one bucket, kept in insertion order.
#[derive(Debug)]
pub struct Chain<K, V> {
    entries: Vec<Entry<K, V>>,
    next_stamp: u64,
}

impl<K, V> Chain<K, V> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_stamp: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &Entry<K, V> {
        &self.entries[index]
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> &mut Entry<K, V> {
        &mut self.entries[index]
    }

    pub fn entries(&self) -> &[Entry<K, V>] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [Entry<K, V>] {
        &mut self.entries
    }

    /// Index of the entry whose cached hash matches and whose key satisfies `eq`.
    #[inline]
    pub fn position(&self, hash: u64, mut eq: impl FnMut(&K) -> bool) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.hash == hash && eq(&e.key))
    }

    /// Index of the first entry stamped after `stamp` (or the first entry).
    #[inline]
    pub fn first_after(&self, stamp: Option<u64>) -> Option<usize> {
        let idx = match stamp {
            None => 0,
            Some(s) => self.entries.partition_point(|e| e.stamp <= s),
        };
        (idx < self.entries.len()).then_some(idx)
    }

    /// Room for one more entry, reported instead of aborting on failure.
    pub fn try_reserve_one(&mut self) -> Result<(), ReserveError> {
        #[cfg(test)]
        if FAIL_NEXT_RESERVE.with(|fail| fail.replace(false)) {
            return Err(ReserveError::CapacityOverflow);
        }
        self.entries.try_reserve(1)?;
        Ok(())
    }

    /// Reserve exactly `additional` slots; used when pre-sizing a rehash target.
    pub fn try_reserve_exact(&mut self, additional: usize) -> Result<(), ReserveError> {
        self.entries.try_reserve_exact(additional)?;
        Ok(())
    }

    /// Append a new entry, returning its index.
    pub fn push(&mut self, hash: u64, key: K, value: V) -> usize {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.entries.push(Entry {
            hash,
            stamp,
            key,
            value,
        });
        self.entries.len() - 1
    }

    /// Unlink the entry at `index`, preserving the order of the rest.
    pub fn remove(&mut self, index: usize) -> Entry<K, V> {
        self.entries.remove(index)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Entry<K, V>> {
        self.entries.drain(..)
    }

    pub fn into_entries(self) -> Vec<Entry<K, V>> {
        self.entries
    }
}

#[cfg(test)]
thread_local! {
    static FAIL_NEXT_RESERVE: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Make this thread's next `try_reserve_one` fail.
#[cfg(test)]
pub(crate) fn fail_next_reserve() {
    FAIL_NEXT_RESERVE.with(|fail| fail.set(true));
}

pub struct Bucket<K, V> {
    lock: RawRwLock,
    chain: UnsafeCell<Chain<K, V>>,
}

// Shared holders read entries concurrently; exclusive holders mutate and drop
// them from whichever thread holds the lock.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Bucket<K, V> {}

impl<K, V> Bucket<K, V> {
    pub const fn new() -> Self {
        Self {
            lock: RawRwLock::INIT,
            chain: UnsafeCell::new(Chain::new()),
        }
    }

    /// Direct access through `&mut`; no other reference to the bucket exists.
    #[inline]
    pub fn chain_mut(&mut self) -> &mut Chain<K, V> {
        self.chain.get_mut()
    }

    pub fn into_chain(self) -> Chain<K, V> {
        self.chain.into_inner()
    }

    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn raw_lock(&self, mode: Mode) {
        match mode {
            // Recursive so a thread already holding shared access never queues
            // behind a waiting writer.
            Mode::Shared => self.lock.lock_shared_recursive(),
            Mode::Exclusive => self.lock.lock_exclusive(),
        }
    }

    fn raw_try_lock(&self, mode: Mode) -> bool {
        match mode {
            Mode::Shared => self.lock.try_lock_shared_recursive(),
            Mode::Exclusive => self.lock.try_lock_exclusive(),
        }
    }
}

/// Scoped lock over one bucket; unlocks on drop.
pub struct BucketGuard<K, V> {
    bucket: NonNull<Bucket<K, V>>,
    mode: Mode,
    held: HeldLock,
}

impl<K, V> BucketGuard<K, V> {
    /// Block until `bucket` is locked in `mode`.
    ///
    /// # Safety
    /// `bucket` must stay alive and in place until the guard is dropped.
    #[track_caller]
    pub unsafe fn lock(bucket: &Bucket<K, V>, mode: Mode) -> Self {
        let held = HeldLock::enter(bucket.addr(), mode);
        bucket.raw_lock(mode);
        Self {
            bucket: NonNull::from(bucket),
            mode,
            held,
        }
    }

    /// Lock `bucket` in `mode` only if that is possible without blocking.
    ///
    /// # Safety
    /// Same contract as [`BucketGuard::lock`].
    pub unsafe fn try_lock(bucket: &Bucket<K, V>, mode: Mode) -> Option<Self> {
        if !bucket.raw_try_lock(mode) {
            return None;
        }
        Some(Self {
            bucket: NonNull::from(bucket),
            mode,
            held: HeldLock::record(bucket.addr(), mode),
        })
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn chain(&self) -> &Chain<K, V> {
        // SAFETY: the bucket is alive (lock contract) and locked at least shared.
        unsafe { &*self.bucket.as_ref().chain.get() }
    }

    #[inline]
    pub fn chain_mut(&mut self) -> &mut Chain<K, V> {
        assert_eq!(self.mode, Mode::Exclusive, "chain_mut requires exclusive lock");
        // SAFETY: exclusive lock held; `&mut self` prevents aliasing through this guard.
        unsafe { &mut *self.bucket.as_ref().chain.get() }
    }

    /// Turn exclusive access into shared access without letting a writer in.
    pub fn downgrade(&mut self) {
        if self.mode == Mode::Exclusive {
            // SAFETY: we hold the exclusive lock.
            unsafe { self.bucket.as_ref().lock.downgrade() };
            self.mode = Mode::Shared;
            self.held.downgrade();
        }
    }
}

impl<K, V> Drop for BucketGuard<K, V> {
    fn drop(&mut self) {
        // SAFETY: the lock was acquired in `self.mode` by this guard.
        unsafe {
            let bucket = self.bucket.as_ref();
            match self.mode {
                Mode::Shared => bucket.lock.unlock_shared(),
                Mode::Exclusive => bucket.lock.unlock_exclusive(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(keys: &[u32]) -> Chain<u32, u32> {
        let mut c = Chain::new();
        for &k in keys {
            c.push(u64::from(k), k, k * 10);
        }
        c
    }

    /// Invariant: removal keeps the remaining entries in stamp order.
    #[test]
    fn remove_preserves_stamp_order() {
        let mut c = chain_of(&[1, 2, 3, 4]);
        let removed = c.remove(1);
        assert_eq!(removed.key, 2);
        let stamps: Vec<u64> = c.entries().iter().map(|e| e.stamp).collect();
        assert_eq!(stamps, vec![0, 2, 3]);
    }

    /// Invariant: `first_after` resumes after the last visited stamp even when
    /// earlier entries were removed or later ones appended.
    #[test]
    fn first_after_resumes_by_stamp() {
        let mut c = chain_of(&[1, 2, 3]);
        assert_eq!(c.first_after(None), Some(0));
        assert_eq!(c.get(c.first_after(Some(0)).unwrap()).key, 2);

        // Visited 1 and 2; entry 1 is erased, 4 appended.
        c.remove(0);
        c.push(4, 4, 40);
        let idx = c.first_after(Some(1)).unwrap();
        assert_eq!(c.get(idx).key, 3);
        let idx = c.first_after(Some(c.get(idx).stamp)).unwrap();
        assert_eq!(c.get(idx).key, 4);
        assert_eq!(c.first_after(Some(3)), None);
    }

    #[test]
    fn armed_reserve_failure_fires_once() {
        let mut c = chain_of(&[1]);
        fail_next_reserve();
        assert_eq!(c.try_reserve_one(), Err(ReserveError::CapacityOverflow));
        assert_eq!(c.try_reserve_one(), Ok(()));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn position_checks_hash_then_key() {
        let c = chain_of(&[5, 6]);
        assert_eq!(c.position(6, |k| *k == 6), Some(1));
        assert_eq!(c.position(6, |k| *k == 5), None);
        assert_eq!(c.position(7, |_| true), None);
    }

    #[test]
    fn shared_guards_stack_and_block_exclusive_try() {
        let b: Bucket<u32, u32> = Bucket::new();
        let g1 = unsafe { BucketGuard::lock(&b, Mode::Shared) };
        let g2 = unsafe { BucketGuard::lock(&b, Mode::Shared) };
        assert!(unsafe { BucketGuard::try_lock(&b, Mode::Exclusive) }.is_none());
        drop(g1);
        drop(g2);
        let g3 = unsafe { BucketGuard::try_lock(&b, Mode::Exclusive) };
        assert!(g3.is_some());
    }

    #[test]
    fn downgrade_admits_readers() {
        let b: Bucket<u32, u32> = Bucket::new();
        let mut g = unsafe { BucketGuard::lock(&b, Mode::Exclusive) };
        g.chain_mut().push(1, 1, 1);
        assert!(unsafe { BucketGuard::try_lock(&b, Mode::Shared) }.is_none());
        g.downgrade();
        assert_eq!(g.mode(), Mode::Shared);
        let r = unsafe { BucketGuard::try_lock(&b, Mode::Shared) }.expect("shared after downgrade");
        assert_eq!(r.chain().len(), 1);
    }
}

//! BucketArray: the power-of-two array of buckets and its redistribution.
//! Table: the array behind its rebuild lock, with the counters driving growth.

use crate::bucket::{Bucket, Chain, Entry};
use crate::error::ReserveError;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, trace, warn};

/// Smallest number of buckets ever allocated.
pub const MIN_BUCKETS: usize = 8;

/// Elements tolerated per bucket before the array doubles.
pub const MAX_LOAD_FACTOR: usize = 1;

pub struct BucketArray<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    mask: usize,
    /// Bumped every time the array is rebuilt.
    generation: u64,
}

/// Bucket count used for a hint: at least `MIN_BUCKETS`, rounded up to a power of two.
pub fn bucket_count_for(hint: usize) -> Result<usize, ReserveError> {
    hint.max(MIN_BUCKETS)
        .checked_next_power_of_two()
        .ok_or(ReserveError::CapacityOverflow)
}

impl<K, V> BucketArray<K, V> {
    pub fn try_with_buckets(hint: usize) -> Result<Self, ReserveError> {
        Self::try_build(bucket_count_for(hint)?, 0)
    }

    fn try_build(count: usize, generation: u64) -> Result<Self, ReserveError> {
        debug_assert!(count.is_power_of_two());
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(count)?;
        buckets.extend((0..count).map(|_| Bucket::new()));
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            mask: count - 1,
            generation,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn index_of(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    #[inline]
    pub fn bucket_for(&self, hash: u64) -> &Bucket<K, V> {
        &self.buckets[self.index_of(hash)]
    }

    #[inline]
    pub fn bucket(&self, index: usize) -> &Bucket<K, V> {
        &self.buckets[index]
    }

    pub fn buckets_mut(&mut self) -> &mut [Bucket<K, V>] {
        &mut self.buckets
    }

    pub fn into_buckets(self) -> Box<[Bucket<K, V>]> {
        self.buckets
    }

    /// Drop every entry, keeping the bucket count.
    pub fn clear(&mut self) {
        for b in self.buckets.iter_mut() {
            b.chain_mut().clear();
        }
    }

    /// Move every entry into a freshly allocated array of `target` buckets
    /// (a power of two).
    ///
    /// All storage for the new layout is reserved before any entry moves, so
    /// on error the array is left untouched. Entries are placed by their
    /// cached hash; user hashing is never invoked here.
    pub fn try_rehash(&mut self, target: usize) -> Result<(), ReserveError> {
        let target = bucket_count_for(target)?;
        let mut next = Self::try_build(target, self.generation.wrapping_add(1))?;

        let mut sizes = Vec::new();
        sizes.try_reserve_exact(target)?;
        sizes.resize(target, 0usize);
        for b in self.buckets.iter_mut() {
            for e in b.chain_mut().entries() {
                sizes[next.index_of(e.hash)] += 1;
            }
        }
        for (b, &n) in next.buckets.iter_mut().zip(&sizes) {
            if n > 0 {
                b.chain_mut().try_reserve_exact(n)?;
            }
        }

        // Old buckets are walked in order, so entries that share a new bucket
        // keep their relative order; stamps are reissued by `push`.
        for b in self.buckets.iter_mut() {
            for Entry {
                hash, key, value, ..
            } in b.chain_mut().drain()
            {
                let idx = next.index_of(hash);
                next.buckets[idx].chain_mut().push(hash, key, value);
            }
        }
        *self = next;
        Ok(())
    }

    /// Deep copy of every chain, keeping the bucket layout.
    pub fn try_clone_with(
        &self,
        mut clone_chain: impl FnMut(&Bucket<K, V>, &mut Chain<K, V>) -> Result<(), ReserveError>,
    ) -> Result<Self, ReserveError> {
        let mut copy = Self::try_build(self.len(), self.generation)?;
        for (src, dst) in self.buckets.iter().zip(copy.buckets.iter_mut()) {
            clone_chain(src, dst.chain_mut())?;
        }
        Ok(copy)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fallibility {
    Fallible,
    Infallible,
}

pub struct Table<K, V> {
    array: RwLock<BucketArray<K, V>>,
    len: AtomicUsize,
    // Mirror of the array length so the growth check takes no lock.
    bucket_count: AtomicUsize,
    /// Growth was due while the array was pinned; the next pin release retries it.
    growth_pending: AtomicBool,
}

impl<K, V> Table<K, V> {
    pub fn new(array: BucketArray<K, V>, len: usize) -> Self {
        Self {
            bucket_count: AtomicUsize::new(array.len()),
            array: RwLock::new(array),
            len: AtomicUsize::new(len),
            growth_pending: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.bucket_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn entry_added(&self) {
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn entry_removed(&self) {
        self.len.fetch_sub(1, Ordering::Relaxed);
    }

    // Shared, recursive: a thread already pinning the array never queues
    // behind a writer.
    #[inline]
    pub fn pin(&self) -> TablePin<'_, K, V> {
        TablePin::new(self.array.read_recursive(), self)
    }

    pub fn try_pin(&self) -> Option<TablePin<'_, K, V>> {
        self.array
            .try_read_recursive()
            .map(|guard| TablePin::new(guard, self))
    }

    pub fn array_mut(&mut self) -> &mut BucketArray<K, V> {
        self.array.get_mut()
    }

    pub fn into_parts(self) -> (BucketArray<K, V>, usize) {
        (self.array.into_inner(), self.len.into_inner())
    }

    #[inline]
    fn overloaded(&self, buckets: usize) -> bool {
        self.len() >= buckets.saturating_mul(MAX_LOAD_FACTOR)
    }

    /// Grow the array once the load factor is reached. Never blocks: while
    /// the array is pinned the growth is marked pending, and the last pin to
    /// be released performs it.
    pub fn grow_if_needed(&self, fallibility: Fallibility) -> Result<(), ReserveError> {
        if !self.overloaded(self.bucket_count()) {
            return Ok(());
        }
        let mut array = match self.array.try_write() {
            Some(array) => array,
            None => {
                self.growth_pending.store(true, Ordering::SeqCst);
                // Pairs with the fence in `TablePin::drop`: either the second
                // attempt succeeds or some pin still held will see the flag.
                fence(Ordering::SeqCst);
                match self.array.try_write() {
                    Some(array) => array,
                    None => {
                        trace!(
                            buckets = self.bucket_count(),
                            len = self.len(),
                            "growth deferred: bucket array is pinned"
                        );
                        return Ok(());
                    }
                }
            }
        };
        self.growth_pending.store(false, Ordering::SeqCst);
        let from = array.len();
        let len = self.len();
        if !self.overloaded(from) {
            return Ok(());
        }
        // Sized for the whole current length: a long pin lets the array fall
        // several doublings behind.
        let target = from.saturating_mul(2).max(len / MAX_LOAD_FACTOR + 1);
        match array.try_rehash(target) {
            Ok(()) => {
                self.bucket_count.store(array.len(), Ordering::Relaxed);
                debug!(
                    from,
                    to = array.len(),
                    len,
                    generation = array.generation(),
                    "grew bucket array"
                );
                Ok(())
            }
            Err(e) if fallibility == Fallibility::Fallible => Err(e),
            Err(e) => {
                warn!(error = %e, buckets = from, "bucket array growth failed; keeping current size");
                Ok(())
            }
        }
    }

    /// Rebuild with at least `buckets` buckets and at least what the current
    /// length needs. On error nothing changes.
    pub fn rehash(&mut self, buckets: usize) -> Result<(), ReserveError> {
        let len = *self.len.get_mut();
        let target = bucket_count_for(buckets.max(len / MAX_LOAD_FACTOR + 1))?;
        let array = self.array.get_mut();
        let from = array.len();
        if target == from {
            return Ok(());
        }
        array.try_rehash(target)?;
        *self.bucket_count.get_mut() = array.len();
        *self.growth_pending.get_mut() = false;
        debug!(
            from,
            to = array.len(),
            len,
            generation = array.generation(),
            "rehashed bucket array"
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        self.array.get_mut().clear();
        *self.len.get_mut() = 0;
    }
}

/// Shared hold on the current bucket array. The array is never rebuilt while
/// a pin is alive; dropping a pin retries any growth deferred meanwhile.
pub struct TablePin<'a, K, V> {
    guard: ManuallyDrop<RwLockReadGuard<'a, BucketArray<K, V>>>,
    table: &'a Table<K, V>,
}

impl<'a, K, V> TablePin<'a, K, V> {
    fn new(guard: RwLockReadGuard<'a, BucketArray<K, V>>, table: &'a Table<K, V>) -> Self {
        Self {
            guard: ManuallyDrop::new(guard),
            table,
        }
    }
}

impl<K, V> Deref for TablePin<'_, K, V> {
    type Target = BucketArray<K, V>;

    #[inline]
    fn deref(&self) -> &BucketArray<K, V> {
        &self.guard
    }
}

impl<K, V> Drop for TablePin<'_, K, V> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        fence(Ordering::SeqCst);
        if self.table.growth_pending.load(Ordering::SeqCst) {
            // Infallible growth reports failure by logging only.
            let _ = self.table.grow_if_needed(Fallibility::Infallible);
        }
    }
}

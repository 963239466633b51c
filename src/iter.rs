//! Traversal: weakly consistent iterators, entry references and ranges.
//!
//! Shared traversals pin the bucket array (so it cannot be rebuilt under
//! them) but hold no bucket lock between steps. Each step locks one bucket in
//! shared mode, and a yielded [`EntryRef`] keeps that lock until dropped.
//! Position within a bucket is tracked by entry stamp rather than index:
//! erasing earlier entries or appending new ones never makes the traversal
//! skip or repeat an entry that was present throughout.

use crate::bucket::{Bucket, BucketGuard, Entry, Mode};
use crate::table::TablePin;
use core::fmt;
use core::ops::Deref;
use std::sync::Arc;

/// Shared pin on a bucket array.
pub(crate) type Pin<'a, K, V> = Arc<TablePin<'a, K, V>>;

/// Shared view of one entry, holding its bucket's lock in shared mode.
///
/// Writers to the same bucket wait until every `EntryRef` into it is dropped.
pub struct EntryRef<'a, K, V> {
    guard: BucketGuard<K, V>,
    index: usize,
    _pin: Pin<'a, K, V>,
}

impl<'a, K, V> EntryRef<'a, K, V> {
    pub(crate) fn new(pin: Pin<'a, K, V>, guard: BucketGuard<K, V>, index: usize) -> Self {
        debug_assert_eq!(guard.mode(), Mode::Shared);
        Self {
            guard,
            index,
            _pin: pin,
        }
    }

    #[inline]
    fn entry(&self) -> &Entry<K, V> {
        self.guard.chain().get(self.index)
    }

    #[inline]
    pub fn key(&self) -> &K {
        &self.entry().key
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.entry().value
    }

    pub fn pair(&self) -> (&K, &V) {
        let e = self.entry();
        (&e.key, &e.value)
    }
}

impl<K, V> Deref for EntryRef<'_, K, V> {
    type Target = V;
    fn deref(&self) -> &V {
        self.value()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for EntryRef<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}

/// The entry matching a key, if any.
pub type EqualRange<'a, K, V> = core::option::IntoIter<EntryRef<'a, K, V>>;

/// Weakly consistent iterator over the entries of a bucket span.
///
/// Every entry present for the whole traversal is yielded exactly once;
/// entries inserted or erased concurrently may or may not be.
pub struct Iter<'a, K, V> {
    pin: Pin<'a, K, V>,
    bucket: usize,
    end: usize,
    last_stamp: Option<u64>,
}

impl<'a, K, V> Iter<'a, K, V> {
    pub(crate) fn new(pin: Pin<'a, K, V>, start: usize, end: usize) -> Self {
        debug_assert!(start <= end && end <= pin.len());
        Self {
            pin,
            bucket: start,
            end,
            last_stamp: None,
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = EntryRef<'a, K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.bucket < self.end {
            // SAFETY: `self.pin` keeps the array alive; the guard either moves
            // into an `EntryRef` with its own pin or is dropped below.
            let guard = unsafe { BucketGuard::lock(self.pin.bucket(self.bucket), Mode::Shared) };
            if let Some(index) = guard.chain().first_after(self.last_stamp) {
                self.last_stamp = Some(guard.chain().get(index).stamp);
                return Some(EntryRef::new(Arc::clone(&self.pin), guard, index));
            }
            drop(guard);
            self.bucket += 1;
            self.last_stamp = None;
        }
        None
    }
}

impl<K, V> fmt::Debug for Iter<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("bucket", &self.bucket)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

/// A splittable span of buckets for divide-and-conquer traversal.
///
/// Splitting never moves an entry between halves: each bucket belongs to
/// exactly one side, so traversing every leaf of a split tree visits each
/// stable entry exactly once. The range pins the bucket array but locks no
/// bucket until iterated.
pub struct Range<'a, K, V> {
    pin: Pin<'a, K, V>,
    start: usize,
    end: usize,
    grainsize: usize,
}

impl<'a, K, V> Range<'a, K, V> {
    pub(crate) fn new(pin: Pin<'a, K, V>, grainsize: usize) -> Self {
        let end = pin.len();
        Self {
            pin,
            start: 0,
            end,
            grainsize: grainsize.max(1),
        }
    }

    /// True when the range covers no buckets.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Number of buckets covered.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn grainsize(&self) -> usize {
        self.grainsize
    }

    /// True when the span is wider than the grainsize.
    #[inline]
    pub fn is_divisible(&self) -> bool {
        self.len() > self.grainsize
    }

    /// Split off the upper half of the span; `self` keeps the lower half.
    ///
    /// Panics if the range is not divisible.
    #[track_caller]
    #[must_use = "the split-off half covers buckets no longer in `self`"]
    pub fn split(&mut self) -> Self {
        assert!(self.is_divisible(), "range is not divisible");
        let mid = self.start + self.len() / 2;
        let upper = Self {
            pin: Arc::clone(&self.pin),
            start: mid,
            end: self.end,
            grainsize: self.grainsize,
        };
        self.end = mid;
        upper
    }

    pub fn iter(&self) -> Iter<'a, K, V> {
        Iter::new(Arc::clone(&self.pin), self.start, self.end)
    }
}

impl<'a, K, V> IntoIterator for Range<'a, K, V> {
    type Item = EntryRef<'a, K, V>;
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        Iter::new(self.pin, self.start, self.end)
    }
}

impl<K, V> fmt::Debug for Range<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Range")
            .field("buckets", &(self.start..self.end))
            .field("grainsize", &self.grainsize)
            .finish()
    }
}

/// Mutable traversal; exclusive access to the map makes locking unnecessary.
pub struct IterMut<'a, K, V> {
    buckets: core::slice::IterMut<'a, Bucket<K, V>>,
    current: core::slice::IterMut<'a, Entry<K, V>>,
    remaining: usize,
}

impl<'a, K, V> IterMut<'a, K, V> {
    pub(crate) fn new(buckets: &'a mut [Bucket<K, V>], len: usize) -> Self {
        Self {
            buckets: buckets.iter_mut(),
            current: Default::default(),
            remaining: len,
        }
    }
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.current.next() {
                self.remaining -= 1;
                return Some((&e.key, &mut e.value));
            }
            self.current = self.buckets.next()?.chain_mut().entries_mut().iter_mut();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for IterMut<'_, K, V> {}

/// Owning traversal, in bucket order.
pub struct IntoIter<K, V> {
    buckets: std::vec::IntoIter<Bucket<K, V>>,
    current: std::vec::IntoIter<Entry<K, V>>,
    remaining: usize,
}

impl<K, V> IntoIter<K, V> {
    pub(crate) fn new(buckets: Box<[Bucket<K, V>]>, len: usize) -> Self {
        Self {
            buckets: buckets.into_vec().into_iter(),
            current: Vec::new().into_iter(),
            remaining: len,
        }
    }
}

impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.current.next() {
                self.remaining -= 1;
                return Some((e.key, e.value));
            }
            self.current = self.buckets.next()?.into_chain().into_entries().into_iter();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for IntoIter<K, V> {}

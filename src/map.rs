//! ConcurrentHashMap: bucket-locked map with accessor-scoped element access.

use crate::accessor::{Access, Accessor, Binding, ConstAccessor};
use crate::bucket::{BucketGuard, Entry, Mode};
use crate::error::{ReserveError, WouldBlock};
use crate::hash_compare::{DefaultHashCompare, HashCompare};
use crate::iter::{EntryRef, EqualRange, IntoIter, Iter, IterMut, Range};
use crate::table::{BucketArray, Fallibility, Table, TablePin};
use core::borrow::Borrow;
use core::fmt;
use std::sync::Arc;

/// A hash map safe for concurrent insertion, lookup, erasure and iteration.
///
/// Every bucket carries its own reader/writer lock; operations on different
/// buckets never block each other. Element access goes through accessors
/// ([`ConstAccessor`], [`Accessor`]) that keep the entry's bucket locked
/// until released.
///
/// The bucket array doubles once the element count reaches the bucket count.
/// Growth happens inside insertion, before any bucket lock is taken, and
/// only when nothing pins the current array (no live accessor, iterator or
/// range anywhere). Growth blocked by a pin is performed when the last pin
/// is released.
pub struct ConcurrentHashMap<K, V, H = DefaultHashCompare> {
    table: Table<K, V>,
    hash_compare: H,
}

impl<K, V> ConcurrentHashMap<K, V> {
    pub fn new() -> Self {
        Self::with_hash_compare(DefaultHashCompare::default())
    }

    /// Pre-size for about `buckets` buckets (rounded up to a power of two).
    pub fn with_capacity(buckets: usize) -> Self {
        Self::with_capacity_and_hash_compare(buckets, DefaultHashCompare::default())
    }
}

impl<K, V> Default for ConcurrentHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H> ConcurrentHashMap<K, V, H> {
    pub fn with_hash_compare(hash_compare: H) -> Self {
        Self::with_capacity_and_hash_compare(0, hash_compare)
    }

    /// Panics if the bucket array cannot be allocated; see
    /// [`try_with_capacity_and_hash_compare`](Self::try_with_capacity_and_hash_compare).
    pub fn with_capacity_and_hash_compare(buckets: usize, hash_compare: H) -> Self {
        match Self::try_with_capacity_and_hash_compare(buckets, hash_compare) {
            Ok(map) => map,
            Err(e) => panic!("ConcurrentHashMap construction failed: {e}"),
        }
    }

    pub fn try_with_capacity_and_hash_compare(
        buckets: usize,
        hash_compare: H,
    ) -> Result<Self, ReserveError> {
        Ok(Self {
            table: Table::new(BucketArray::try_with_buckets(buckets)?, 0),
            hash_compare,
        })
    }

    pub fn hash_compare(&self) -> &H {
        &self.hash_compare
    }

    /// Number of live entries. Exact when no insert or erase is in flight.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        isize::MAX as usize / core::mem::size_of::<Entry<K, V>>().max(1)
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    #[inline]
    fn pin(&self) -> TablePin<'_, K, V> {
        self.table.pin()
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.pin().generation()
    }

    #[inline]
    fn owner(&self) -> *const () {
        &self.table as *const Table<K, V> as *const ()
    }

    /// Reallocate the bucket array to at least `buckets` buckets (and at
    /// least what the current length needs) and redistribute every entry.
    ///
    /// Requires exclusive access. Never loses elements; on error the map is
    /// unchanged. A target below the current size shrinks the array.
    pub fn rehash(&mut self, buckets: usize) -> Result<(), ReserveError> {
        self.table.rehash(buckets)
    }

    /// Remove every entry. Requires exclusive access; keeps the bucket count.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Exchange contents with `other`. Requires exclusive access to both.
    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(self, other);
    }

    /// Weakly consistent traversal; see [`Iter`].
    pub fn iter(&self) -> Iter<'_, K, V> {
        let pin = Arc::new(self.pin());
        let end = pin.len();
        Iter::new(pin, 0, end)
    }

    /// Lock-free traversal with mutable values; requires exclusive access.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        let len = self.table.len();
        IterMut::new(self.table.array_mut().buckets_mut(), len)
    }

    /// Splittable range over the whole bucket array for divide-and-conquer
    /// traversal. `grainsize` is the bucket span below which the range stops
    /// being divisible (0 is treated as 1).
    pub fn range(&self, grainsize: usize) -> Range<'_, K, V> {
        Range::new(Arc::new(self.pin()), grainsize)
    }
}

impl<K, V, H> ConcurrentHashMap<K, V, H> {
    /// Locate `key` with its bucket locked in `mode` and hand both to `f`.
    fn locate<Q, R>(
        &self,
        key: &Q,
        mode: Mode,
        f: impl FnOnce(&mut BucketGuard<K, V>, Option<usize>) -> R,
    ) -> R
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashCompare<Q>,
    {
        let hash = self.hash_compare.hash(key);
        let table = self.pin();
        // SAFETY: `table` pins the array until after the guard is dropped.
        let mut guard = unsafe { BucketGuard::lock(table.bucket_for(hash), mode) };
        let pos = guard
            .chain()
            .position(hash, |k| self.hash_compare.equal(k.borrow(), key));
        f(&mut guard, pos)
    }

    /// Bind `acc` to the entry for `key`. Returns false, leaving `acc`
    /// unbound, when the key is absent. Any previous binding is released
    /// first.
    pub fn find<'a, A, Q>(&'a self, acc: &mut A, key: &Q) -> bool
    where
        A: Access<'a, K, V>,
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashCompare<Q>,
    {
        *acc.slot() = None;
        let hash = self.hash_compare.hash(key);
        let table = self.pin();
        // SAFETY: the guard either moves into a binding next to `table` or is
        // dropped before it.
        let guard = unsafe { BucketGuard::lock(table.bucket_for(hash), A::MODE) };
        let pos = guard
            .chain()
            .position(hash, |k| self.hash_compare.equal(k.borrow(), key));
        match pos {
            Some(index) => {
                *acc.slot() = Some(Binding::new(table, guard, index, self.owner()));
                true
            }
            None => false,
        }
    }

    /// Like [`find`](Self::find) but fails with `WouldBlock` instead of
    /// waiting for a bucket held in a conflicting mode.
    pub fn try_find<'a, A, Q>(&'a self, acc: &mut A, key: &Q) -> Result<bool, WouldBlock>
    where
        A: Access<'a, K, V>,
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashCompare<Q>,
    {
        *acc.slot() = None;
        let hash = self.hash_compare.hash(key);
        let table = self.table.try_pin().ok_or(WouldBlock)?;
        // SAFETY: as in `find`.
        let guard =
            unsafe { BucketGuard::try_lock(table.bucket_for(hash), A::MODE) }.ok_or(WouldBlock)?;
        let pos = guard
            .chain()
            .position(hash, |k| self.hash_compare.equal(k.borrow(), key));
        match pos {
            Some(index) => {
                *acc.slot() = Some(Binding::new(table, guard, index, self.owner()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 1 if `key` is present, else 0. No lock outlives the call.
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashCompare<Q>,
    {
        self.locate(key, Mode::Shared, |_, pos| usize::from(pos.is_some()))
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashCompare<Q>,
    {
        self.count(key) == 1
    }

    /// The entry for `key` as a zero- or one-element iterator.
    pub fn equal_range<Q>(&self, key: &Q) -> EqualRange<'_, K, V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashCompare<Q>,
    {
        let hash = self.hash_compare.hash(key);
        let pin = Arc::new(self.pin());
        // SAFETY: the guard moves into an `EntryRef` holding `pin`, or drops first.
        let guard = unsafe { BucketGuard::lock(pin.bucket_for(hash), Mode::Shared) };
        let pos = guard
            .chain()
            .position(hash, |k| self.hash_compare.equal(k.borrow(), key));
        match pos {
            Some(index) => Some(EntryRef::new(pin, guard, index)),
            None => None,
        }
        .into_iter()
    }

    /// Remove the entry for `key`. The entry is dropped after its bucket is
    /// unlocked, so `Drop` for `K`/`V` may re-enter the map.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashCompare<Q>,
    {
        let removed = self.locate(key, Mode::Exclusive, |guard, pos| {
            pos.map(|index| guard.chain_mut().remove(index))
        });
        match removed {
            Some(entry) => {
                self.table.entry_removed();
                drop(entry);
                true
            }
            None => false,
        }
    }

    /// Remove the entry `acc` is bound to and unbind it.
    ///
    /// Panics if `acc` is unbound or bound to an entry of another map.
    #[track_caller]
    pub fn erase_accessor(&self, acc: &mut Accessor<'_, K, V>) -> bool {
        let binding = match acc.take_binding() {
            Some(b) => b,
            None => panic!("erase_accessor requires a bound accessor"),
        };
        assert!(
            core::ptr::eq(binding.owner(), self.owner()),
            "accessor is bound to a different map"
        );
        debug_assert_eq!(binding.mode(), Mode::Exclusive);
        let entry = binding.unlink();
        self.table.entry_removed();
        drop(entry);
        true
    }
}

impl<K, V, H> ConcurrentHashMap<K, V, H>
where
    H: HashCompare<K>,
{
    /// Bind to the entry for `key`, creating it from `make` when absent.
    /// The bucket is locked exclusively for the lookup and insertion, then
    /// downgraded when `mode` is shared.
    fn bind_or_insert<'a, F>(
        &'a self,
        key: K,
        make: F,
        mode: Mode,
        fallibility: Fallibility,
    ) -> Result<(Binding<'a, K, V>, bool), ReserveError>
    where
        F: FnOnce() -> V,
    {
        // Before any bucket lock: growth needs the array unpinned.
        self.table.grow_if_needed(fallibility)?;

        let hash = self.hash_compare.hash(&key);
        let table = self.pin();
        // SAFETY: the guard moves into a binding next to `table`, or both drop
        // with the guard first.
        let mut guard = unsafe { BucketGuard::lock(table.bucket_for(hash), Mode::Exclusive) };
        let existing = guard
            .chain()
            .position(hash, |k| self.hash_compare.equal(k, &key));
        let (index, inserted) = match existing {
            Some(index) => (index, false),
            None => {
                let chain = guard.chain_mut();
                if fallibility == Fallibility::Fallible {
                    chain.try_reserve_one()?;
                }
                // `make` runs before the push: a panic there links nothing.
                let value = make();
                let index = chain.push(hash, key, value);
                self.table.entry_added();
                (index, true)
            }
        };
        if mode == Mode::Shared {
            guard.downgrade();
        }
        Ok((Binding::new(table, guard, index, self.owner()), inserted))
    }

    fn bind_infallible<'a, A, F>(&'a self, acc: &mut A, key: K, make: F) -> bool
    where
        A: Access<'a, K, V>,
        F: FnOnce() -> V,
    {
        *acc.slot() = None;
        match self.bind_or_insert(key, make, A::MODE, Fallibility::Infallible) {
            Ok((binding, inserted)) => {
                *acc.slot() = Some(binding);
                inserted
            }
            Err(e) => panic!("ConcurrentHashMap insertion failed: {e}"),
        }
    }

    /// Insert `key` with `V::default()` unless present, binding `acc` to the
    /// entry either way. Returns true iff a new entry was created.
    pub fn insert<'a, A>(&'a self, acc: &mut A, key: K) -> bool
    where
        A: Access<'a, K, V>,
        V: Default,
    {
        self.bind_infallible(acc, key, V::default)
    }

    /// Like [`insert`](Self::insert); `make` only runs when inserting.
    pub fn insert_with<'a, A, F>(&'a self, acc: &mut A, key: K, make: F) -> bool
    where
        A: Access<'a, K, V>,
        F: FnOnce() -> V,
    {
        self.bind_infallible(acc, key, make)
    }

    /// Insert `(key, value)` unless `key` is present, binding `acc` to the
    /// entry either way. On a duplicate, `value` is dropped and the stored
    /// value is kept.
    pub fn emplace<'a, A>(&'a self, acc: &mut A, key: K, value: V) -> bool
    where
        A: Access<'a, K, V>,
    {
        self.bind_infallible(acc, key, move || value)
    }

    /// Fallible [`insert_with`](Self::insert_with): allocation failure is
    /// reported and leaves both the map and `acc` (unbound) unchanged.
    pub fn try_insert_with<'a, A, F>(
        &'a self,
        acc: &mut A,
        key: K,
        make: F,
    ) -> Result<bool, ReserveError>
    where
        A: Access<'a, K, V>,
        F: FnOnce() -> V,
    {
        *acc.slot() = None;
        let (binding, inserted) = self.bind_or_insert(key, make, A::MODE, Fallibility::Fallible)?;
        *acc.slot() = Some(binding);
        Ok(inserted)
    }

    /// Insert `key` with `V::default()` unless present; no lock outlives the call.
    pub fn insert_key(&self, key: K) -> bool
    where
        V: Default,
    {
        let mut acc = Accessor::new();
        self.bind_infallible(&mut acc, key, V::default)
    }

    /// Insert `(key, value)` unless present; no lock outlives the call.
    pub fn insert_value(&self, key: K, value: V) -> bool {
        let mut acc = Accessor::new();
        self.bind_infallible(&mut acc, key, move || value)
    }

    pub fn try_insert_value(&self, key: K, value: V) -> Result<bool, ReserveError> {
        let mut acc = Accessor::new();
        self.try_insert_with(&mut acc, key, move || value)
    }

    pub fn from_iter_with_hash_compare<I>(iter: I, hash_compare: H) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let iter = iter.into_iter();
        let mut map = Self::with_capacity_and_hash_compare(iter.size_hint().0, hash_compare);
        map.extend(iter);
        map
    }
}

impl<K, V, H> FromIterator<(K, V)> for ConcurrentHashMap<K, V, H>
where
    H: HashCompare<K> + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_iter_with_hash_compare(iter, H::default())
    }
}

/// First occurrence of a key wins, as with [`ConcurrentHashMap::insert_value`].
impl<K, V, H> Extend<(K, V)> for ConcurrentHashMap<K, V, H>
where
    H: HashCompare<K>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert_value(k, v);
        }
    }
}

impl<K, V, H> Clone for ConcurrentHashMap<K, V, H>
where
    K: Clone,
    V: Clone,
    H: Clone,
{
    /// Copies bucket by bucket under shared locks; concurrent writers may or
    /// may not be reflected, as with iteration.
    fn clone(&self) -> Self {
        let table = self.pin();
        let mut len = 0;
        let copy = table.try_clone_with(|src, dst| {
            // SAFETY: `table` pins the source array for the whole copy.
            let guard = unsafe { BucketGuard::lock(src, Mode::Shared) };
            dst.try_reserve_exact(guard.chain().len())?;
            for e in guard.chain().entries() {
                dst.push(e.hash, e.key.clone(), e.value.clone());
            }
            len += guard.chain().len();
            Ok(())
        });
        match copy {
            Ok(copy) => Self {
                table: Table::new(copy, len),
                hash_compare: self.hash_compare.clone(),
            },
            Err(e) => panic!("ConcurrentHashMap clone failed: {e}"),
        }
    }
}

/// Content equality: same keys (by the other map's `HashCompare`) mapped to
/// equal values. Bucket layout is ignored.
impl<K, V, H> PartialEq for ConcurrentHashMap<K, V, H>
where
    V: PartialEq,
    H: HashCompare<K>,
{
    fn eq(&self, other: &Self) -> bool {
        if core::ptr::eq(self, other) {
            return true;
        }
        if self.len() != other.len() {
            return false;
        }
        self.iter().all(|e| {
            let mut acc = ConstAccessor::new();
            other.find(&mut acc, e.key()) && acc.value() == e.value()
        })
    }
}

impl<K, V, H> Eq for ConcurrentHashMap<K, V, H>
where
    V: Eq,
    H: HashCompare<K>,
{
}

impl<K: fmt::Debug, V: fmt::Debug, H> fmt::Debug for ConcurrentHashMap<K, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for e in self.iter() {
            m.entry(e.key(), e.value());
        }
        m.finish()
    }
}

impl<'a, K, V, H> IntoIterator for &'a ConcurrentHashMap<K, V, H> {
    type Item = EntryRef<'a, K, V>;
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, H> IntoIterator for &'a mut ConcurrentHashMap<K, V, H> {
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<K, V, H> IntoIterator for ConcurrentHashMap<K, V, H> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let (array, len) = self.table.into_parts();
        IntoIter::new(array.into_buckets(), len)
    }
}

/// Exchange the contents of two maps.
pub fn swap<K, V, H>(a: &mut ConcurrentHashMap<K, V, H>, b: &mut ConcurrentHashMap<K, V, H>) {
    a.swap(b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::hash::BuildHasher;
    use std::cell::Cell;
    use std::collections::BTreeSet;

    // Every key hashes to 0, so every key shares bucket 0.
    #[derive(Clone, Default)]
    struct ConstBuildHasher;
    struct ConstHasher;
    impl BuildHasher for ConstBuildHasher {
        type Hasher = ConstHasher;
        fn build_hasher(&self) -> Self::Hasher {
            ConstHasher
        }
    }
    impl core::hash::Hasher for ConstHasher {
        fn write(&mut self, _bytes: &[u8]) {}
        fn finish(&self) -> u64 {
            0
        }
    }

    type Colliding<K, V> = ConcurrentHashMap<K, V, DefaultHashCompare<ConstBuildHasher>>;

    fn colliding<K, V>() -> Colliding<K, V> {
        ConcurrentHashMap::with_hash_compare(DefaultHashCompare::with_hasher(ConstBuildHasher))
    }

    /// Invariant: a miss leaves the accessor unbound, a hit binds it.
    #[test]
    fn find_binds_only_on_hit() {
        let m: ConcurrentHashMap<u32, &str> = ConcurrentHashMap::new();
        m.insert_value(1, "a");

        let mut acc = ConstAccessor::new();
        assert!(!m.find(&mut acc, &2));
        assert!(acc.is_empty());

        assert!(m.find(&mut acc, &1));
        assert!(!acc.is_empty());
        assert_eq!(*acc.key(), 1);
        assert_eq!(*acc.value(), "a");

        // Re-binding to a miss releases the previous binding.
        assert!(!m.find(&mut acc, &3));
        assert!(acc.is_empty());
    }

    /// Invariant: insert through an accessor reports "found, not inserted"
    /// for an existing key and binds to the stored entry.
    #[test]
    fn insert_with_accessor_binds_existing() {
        let m: ConcurrentHashMap<String, i32> = ConcurrentHashMap::new();
        let mut acc = Accessor::new();
        assert!(m.insert(&mut acc, "k".to_string()));
        *acc += 5;
        acc.release();

        assert!(!m.insert(&mut acc, "k".to_string()));
        assert_eq!(*acc.value(), 5);
        drop(acc);
        assert_eq!(m.len(), 1);
    }

    /// Invariant: `insert_with` only runs the constructor when inserting.
    #[test]
    fn insert_with_is_lazy() {
        let m: ConcurrentHashMap<&str, String> = ConcurrentHashMap::new();
        let calls = Cell::new(0);
        let mut acc = ConstAccessor::new();
        let make = || {
            calls.set(calls.get() + 1);
            "v".to_string()
        };
        assert!(m.insert_with(&mut acc, "k", make));
        assert!(!m.insert_with(&mut acc, "k", || {
            calls.set(calls.get() + 1);
            "v2".to_string()
        }));
        assert_eq!(calls.get(), 1);
        assert_eq!(acc.value(), "v");
    }

    /// Invariant: a const accessor obtained by insertion holds the bucket
    /// shared, so other shared lookups of that bucket still succeed.
    #[test]
    fn insert_through_const_accessor_downgrades() {
        let m: Colliding<u32, u32> = colliding();
        let mut acc = ConstAccessor::new();
        assert!(m.emplace(&mut acc, 1, 10));

        let mut other = ConstAccessor::new();
        assert_eq!(m.try_find(&mut other, &1), Ok(true));
        assert_eq!(*other.value(), 10);

        let mut writer = Accessor::new();
        assert_eq!(m.try_find(&mut writer, &1), Err(WouldBlock));
        assert!(writer.is_empty());
    }

    /// Invariant: an exclusive accessor blocks other accessors on the bucket
    /// until released.
    #[test]
    fn exclusive_accessor_excludes_until_release() {
        let m: Colliding<u32, u32> = colliding();
        m.insert_value(1, 1);
        m.insert_value(2, 2);

        let mut w = Accessor::new();
        assert!(m.find(&mut w, &1));
        std::thread::scope(|s| {
            s.spawn(|| {
                let mut r = ConstAccessor::new();
                assert_eq!(m.try_find(&mut r, &2), Err(WouldBlock));
            });
        });
        w.release();
        let mut r = ConstAccessor::new();
        assert_eq!(m.try_find(&mut r, &2), Ok(true));
    }

    /// Invariant: lookups under total hash collision resolve by equality.
    #[test]
    fn collisions_resolve_by_equality() {
        let m: Colliding<String, i32> = colliding();
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            assert!(m.insert_value(k.to_string(), i as i32));
        }
        let mut acc = ConstAccessor::new();
        assert!(m.find(&mut acc, "b"));
        assert_eq!(*acc.value(), 1);
        assert!(!m.find(&mut acc, "d"));
        drop(acc);
        assert!(m.erase("a"));
        assert_eq!(m.count("b"), 1);
        assert_eq!(m.count("a"), 0);
    }

    /// Invariant: erasing through an accessor unlinks its entry and unbinds it.
    #[test]
    fn erase_accessor_unbinds() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        m.insert_value(7, 70);
        let mut acc = Accessor::new();
        assert!(m.find(&mut acc, &7));
        assert!(m.erase_accessor(&mut acc));
        assert!(acc.is_empty());
        assert_eq!(m.len(), 0);
        assert_eq!(m.count(&7), 0);
    }

    #[test]
    #[should_panic(expected = "requires a bound accessor")]
    fn erase_unbound_accessor_panics() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        let mut acc = Accessor::new();
        m.erase_accessor(&mut acc);
    }

    #[test]
    #[should_panic(expected = "different map")]
    fn erase_accessor_of_other_map_panics() {
        let a: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        let b: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        a.insert_value(1, 1);
        let mut acc = Accessor::new();
        assert!(a.find(&mut acc, &1));
        b.erase_accessor(&mut acc);
    }

    #[test]
    #[should_panic(expected = "not bound")]
    fn unbound_value_access_panics() {
        let acc: ConstAccessor<'_, u32, u32> = ConstAccessor::new();
        let _ = acc.value();
    }

    /// Invariant: a value dropped by `erase` may re-enter the map.
    #[test]
    fn erased_value_drop_may_reenter() {
        use std::sync::OnceLock;

        static MAP: OnceLock<ConcurrentHashMap<u32, Reenter>> = OnceLock::new();
        struct Reenter(bool);
        impl Drop for Reenter {
            fn drop(&mut self) {
                if self.0 {
                    let m = MAP.get_or_init(ConcurrentHashMap::new);
                    // Key 1 lives in the bucket that was just unlocked.
                    assert_eq!(m.count(&1), 0);
                    m.insert_value(2, Reenter(false));
                }
            }
        }

        let m = MAP.get_or_init(ConcurrentHashMap::new);
        m.insert_value(1, Reenter(true));
        assert!(m.erase(&1));
        assert_eq!(m.count(&2), 1);
    }

    /// Invariant: growth doubles the array once the load factor is reached
    /// and keeps every entry.
    #[test]
    fn insertion_grows_bucket_array() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        let start = m.bucket_count();
        for k in 0..(start as u32 * 4) {
            m.insert_value(k, k);
        }
        assert!(m.bucket_count() > start);
        assert!(m.generation() > 0);
        for k in 0..(start as u32 * 4) {
            assert_eq!(m.count(&k), 1);
        }
    }

    /// Invariant: growth is deferred while a range pins the array and is
    /// performed when the pin is released, without any further insertion.
    #[test]
    fn deferred_growth_runs_when_range_is_released() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::with_capacity(8);
        let pinned = m.range(1);
        for k in 0..64 {
            m.insert_value(k, k);
        }
        assert_eq!(m.bucket_count(), 8);
        assert_eq!(m.generation(), 0);
        assert_eq!(pinned.iter().count(), 64);
        drop(pinned);

        // One rebuild sized for all 64 entries.
        assert_eq!(m.bucket_count(), 128);
        assert_eq!(m.generation(), 1);
        for k in 0..64 {
            assert_eq!(m.count(&k), 1);
        }
    }

    // Insert each key unless this thread holds its bucket; returns how many went in.
    fn insert_where_unheld(
        m: &ConcurrentHashMap<u32, u32>,
        keys: impl IntoIterator<Item = u32>,
    ) -> usize {
        let mut inserted = 0;
        for k in keys {
            let mut writer = Accessor::new();
            if m.try_find(&mut writer, &k).is_err() {
                continue;
            }
            drop(writer);
            if m.insert_value(k, k) {
                inserted += 1;
            }
        }
        inserted
    }

    /// Invariant: with iterator, entry reference and accessor pins alive,
    /// growth waits for the last of them; releasing it grows the array to
    /// fit the current length.
    #[test]
    fn last_released_pin_performs_deferred_growth() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::with_capacity(8);
        m.insert_value(0, 0);
        let it = m.iter();
        let entry = m.equal_range(&0).next().expect("key 0 is present");
        let mut acc = ConstAccessor::new();
        assert!(m.find(&mut acc, &0));

        assert!(insert_where_unheld(&m, 1..200) > 0);
        assert_eq!(m.bucket_count(), 8);

        drop(it);
        drop(entry);
        assert_eq!(m.bucket_count(), 8);
        drop(acc);
        assert!(m.bucket_count() >= m.len());
        assert_eq!(m.generation(), 1);
    }

    /// Invariant: an accessor binding survives concurrent-style insertions
    /// into other buckets of the same array.
    #[test]
    fn accessor_stays_valid_across_insertions() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::with_capacity(1024);
        let mut acc = Accessor::new();
        assert!(m.emplace(&mut acc, 0, 100));
        let mut inserted = 0;
        for k in 1..2000 {
            // Skip keys sharing the held bucket: this thread would wait on itself.
            let mut peek = ConstAccessor::new();
            if m.try_find(&mut peek, &k).is_err() {
                continue;
            }
            drop(peek);
            m.insert_value(k, k);
            inserted += 1;
        }
        assert!(inserted > 0);
        let (k, v) = acc.get_mut().expect("accessor is bound");
        assert_eq!(*k, 0);
        *v += 1;
        drop(acc);
        let mut r = ConstAccessor::new();
        assert!(m.find(&mut r, &0));
        assert_eq!(*r.value(), 101);
        assert!(m.bucket_count() >= m.len());
    }

    /// Invariant: explicit rehash never loses elements and never drops below
    /// what the length needs.
    #[test]
    fn explicit_rehash_keeps_entries() {
        let mut m: ConcurrentHashMap<u32, u32> = (0..100).map(|k| (k, k * 2)).collect();
        m.rehash(1024).unwrap();
        assert_eq!(m.bucket_count(), 1024);
        m.rehash(0).unwrap();
        assert!(m.bucket_count() > 100);
        assert_eq!(m.len(), 100);
        for k in 0..100 {
            let mut acc = ConstAccessor::new();
            assert!(m.find(&mut acc, &k));
            assert_eq!(*acc.value(), k * 2);
        }
        assert_eq!(m.rehash(usize::MAX), Err(ReserveError::CapacityOverflow));
        assert_eq!(m.len(), 100);
    }

    #[test]
    fn fallible_paths_succeed_normally() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        assert_eq!(m.try_insert_value(1, 1), Ok(true));
        assert_eq!(m.try_insert_value(1, 2), Ok(false));
        let mut acc = Accessor::new();
        assert_eq!(m.try_insert_with(&mut acc, 1, || 3), Ok(false));
        assert_eq!(*acc.value(), 1);
    }

    /// Invariant: a failed reservation creates nothing, never runs the value
    /// constructor and leaves the accessor unbound.
    #[test]
    fn failed_reservation_leaves_map_and_accessor_untouched() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        m.insert_value(1, 10);
        let mut acc = Accessor::new();
        assert!(m.find(&mut acc, &1));

        let made = Cell::new(false);
        crate::bucket::fail_next_reserve();
        let res = m.try_insert_with(&mut acc, 2, || {
            made.set(true);
            20
        });
        assert_eq!(res, Err(ReserveError::CapacityOverflow));
        assert!(acc.is_empty());
        assert!(!made.get());
        assert_eq!(m.len(), 1);
        assert_eq!(m.count(&2), 0);

        crate::bucket::fail_next_reserve();
        assert_eq!(m.try_insert_value(3, 30), Err(ReserveError::CapacityOverflow));
        assert_eq!(m.len(), 1);
        assert_eq!(m.try_insert_value(3, 30), Ok(true));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn hash_compare_is_the_one_supplied() {
        let m: Colliding<u32, u32> = colliding();
        assert_eq!(HashCompare::<u32>::hash(m.hash_compare(), &12345), 0);
        let _: &ConstBuildHasher = m.hash_compare().hasher();
    }

    #[test]
    fn construction_overflow_is_reported() {
        let r = ConcurrentHashMap::<u32, u32>::try_with_capacity_and_hash_compare(
            usize::MAX,
            DefaultHashCompare::default(),
        );
        assert_eq!(r.err(), Some(ReserveError::CapacityOverflow));
    }

    /// Invariant (debug-only): asking for a bucket this thread holds
    /// exclusively panics instead of deadlocking.
    #[cfg(debug_assertions)]
    #[test]
    fn self_deadlock_panics_in_debug() {
        let m: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        m.insert_value(1, 1);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut acc = Accessor::new();
            assert!(m.find(&mut acc, &1));
            let _ = m.count(&1);
        }));
        assert!(res.is_err(), "expected self-deadlock to panic in debug builds");
        // The accessor was released during unwinding.
        assert_eq!(m.count(&1), 1);
    }

    #[test]
    fn iter_mut_and_into_iter() {
        let mut m: ConcurrentHashMap<u32, u32> = (0..10).map(|k| (k, k)).collect();
        for (_, v) in m.iter_mut() {
            *v += 100;
        }
        assert_eq!(m.iter_mut().len(), 10);
        let got: BTreeSet<(u32, u32)> = m.into_iter().collect();
        let want: BTreeSet<(u32, u32)> = (0..10).map(|k| (k, k + 100)).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn clear_and_swap() {
        let mut a: ConcurrentHashMap<u32, u32> = (0..5).map(|k| (k, k)).collect();
        let mut b: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::new();
        swap(&mut a, &mut b);
        assert!(a.is_empty());
        assert_eq!(b.len(), 5);
        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.count(&1), 0);
    }
}

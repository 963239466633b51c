//! Accessors: scoped handles granting shared or exclusive access to one entry.
//!
//! An accessor starts unbound. `find`/`insert`/`emplace` bind it to an entry
//! while holding that entry's bucket lock (shared for [`ConstAccessor`],
//! exclusive for [`Accessor`]) and a pin on the current bucket array. The
//! lock is released by [`release`](Accessor::release), by re-binding, or when
//! the accessor is dropped, including during unwinding.
//!
//! A thread holding a bound accessor should not ask for a second entry in a
//! way that could wait on another thread doing the same in the opposite
//! order; holding one accessor at a time is always safe.

use crate::bucket::{BucketGuard, Entry, Mode};
use crate::table::TablePin;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A live binding: bucket lock, entry position and array pin.
///
/// Fields drop in declaration order, so the bucket unlocks before the pin
/// on the array is released (and before any deferred growth it triggers).
pub struct Binding<'a, K, V> {
    guard: BucketGuard<K, V>,
    index: usize,
    owner: *const (),
    _table: TablePin<'a, K, V>,
}

impl<'a, K, V> Binding<'a, K, V> {
    pub(crate) fn new(
        table: TablePin<'a, K, V>,
        guard: BucketGuard<K, V>,
        index: usize,
        owner: *const (),
    ) -> Self {
        Self {
            guard,
            index,
            owner,
            _table: table,
        }
    }

    #[inline]
    pub(crate) fn owner(&self) -> *const () {
        self.owner
    }

    #[inline]
    pub(crate) fn mode(&self) -> Mode {
        self.guard.mode()
    }

    #[inline]
    fn entry(&self) -> &Entry<K, V> {
        self.guard.chain().get(self.index)
    }

    #[inline]
    fn entry_mut(&mut self) -> &mut Entry<K, V> {
        self.guard.chain_mut().get_mut(self.index)
    }

    /// Unlink the bound entry. The bucket unlocks when `self` is dropped at
    /// return, before the caller drops the entry.
    pub(crate) fn unlink(mut self) -> Entry<K, V> {
        self.guard.chain_mut().remove(self.index)
    }
}

pub(crate) mod sealed {
    use super::Binding;
    use crate::bucket::Mode;

    pub trait Sealed<'a, K, V> {
        const MODE: Mode;
        fn slot(&mut self) -> &mut Option<Binding<'a, K, V>>;
    }
}

/// Either accessor kind; lets `find` and the insert family bind both.
pub trait Access<'a, K, V>: sealed::Sealed<'a, K, V> {}

#[track_caller]
fn bound<'b, 'a, K, V>(binding: &'b Option<Binding<'a, K, V>>) -> &'b Binding<'a, K, V> {
    match binding {
        Some(b) => b,
        None => panic!("accessor is not bound to an entry"),
    }
}

/// Read-only accessor; holds its entry's bucket in shared mode.
pub struct ConstAccessor<'a, K, V> {
    binding: Option<Binding<'a, K, V>>,
}

impl<'a, K, V> ConstAccessor<'a, K, V> {
    pub fn new() -> Self {
        Self { binding: None }
    }

    /// True while unbound.
    pub fn is_empty(&self) -> bool {
        self.binding.is_none()
    }

    /// Unbind and release the lock, if any.
    pub fn release(&mut self) {
        self.binding = None;
    }

    pub fn get(&self) -> Option<(&K, &V)> {
        self.binding.as_ref().map(|b| {
            let e = b.entry();
            (&e.key, &e.value)
        })
    }

    /// Panics when unbound.
    #[track_caller]
    pub fn key(&self) -> &K {
        &bound(&self.binding).entry().key
    }

    /// Panics when unbound.
    #[track_caller]
    pub fn value(&self) -> &V {
        &bound(&self.binding).entry().value
    }
}

impl<'a, K, V> sealed::Sealed<'a, K, V> for ConstAccessor<'a, K, V> {
    const MODE: Mode = Mode::Shared;
    fn slot(&mut self) -> &mut Option<Binding<'a, K, V>> {
        &mut self.binding
    }
}

impl<'a, K, V> Access<'a, K, V> for ConstAccessor<'a, K, V> {}

impl<'a, K, V> Default for ConstAccessor<'a, K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, K, V> Deref for ConstAccessor<'a, K, V> {
    type Target = V;
    #[track_caller]
    fn deref(&self) -> &V {
        self.value()
    }
}

impl<'a, K: fmt::Debug, V: fmt::Debug> fmt::Debug for ConstAccessor<'a, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some((k, v)) => f
                .debug_struct("ConstAccessor")
                .field("key", k)
                .field("value", v)
                .finish(),
            None => f.write_str("ConstAccessor(unbound)"),
        }
    }
}

/// Read-write accessor; holds its entry's bucket in exclusive mode.
pub struct Accessor<'a, K, V> {
    binding: Option<Binding<'a, K, V>>,
}

impl<'a, K, V> Accessor<'a, K, V> {
    pub fn new() -> Self {
        Self { binding: None }
    }

    /// True while unbound.
    pub fn is_empty(&self) -> bool {
        self.binding.is_none()
    }

    /// Unbind and release the lock, if any.
    pub fn release(&mut self) {
        self.binding = None;
    }

    pub fn get(&self) -> Option<(&K, &V)> {
        self.binding.as_ref().map(|b| {
            let e = b.entry();
            (&e.key, &e.value)
        })
    }

    pub fn get_mut(&mut self) -> Option<(&K, &mut V)> {
        self.binding.as_mut().map(|b| {
            let e = b.entry_mut();
            (&e.key, &mut e.value)
        })
    }

    /// Panics when unbound.
    #[track_caller]
    pub fn key(&self) -> &K {
        &bound(&self.binding).entry().key
    }

    /// Panics when unbound.
    #[track_caller]
    pub fn value(&self) -> &V {
        &bound(&self.binding).entry().value
    }

    /// Panics when unbound.
    #[track_caller]
    pub fn value_mut(&mut self) -> &mut V {
        match self.binding.as_mut() {
            Some(b) => &mut b.entry_mut().value,
            None => panic!("accessor is not bound to an entry"),
        }
    }

    pub(crate) fn take_binding(&mut self) -> Option<Binding<'a, K, V>> {
        self.binding.take()
    }
}

impl<'a, K, V> sealed::Sealed<'a, K, V> for Accessor<'a, K, V> {
    const MODE: Mode = Mode::Exclusive;
    fn slot(&mut self) -> &mut Option<Binding<'a, K, V>> {
        &mut self.binding
    }
}

impl<'a, K, V> Access<'a, K, V> for Accessor<'a, K, V> {}

impl<'a, K, V> Default for Accessor<'a, K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, K, V> Deref for Accessor<'a, K, V> {
    type Target = V;
    #[track_caller]
    fn deref(&self) -> &V {
        self.value()
    }
}

impl<'a, K, V> DerefMut for Accessor<'a, K, V> {
    #[track_caller]
    fn deref_mut(&mut self) -> &mut V {
        self.value_mut()
    }
}

impl<'a, K: fmt::Debug, V: fmt::Debug> fmt::Debug for Accessor<'a, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some((k, v)) => f
                .debug_struct("Accessor")
                .field("key", k)
                .field("value", v)
                .finish(),
            None => f.write_str("Accessor(unbound)"),
        }
    }
}

//! Pluggable hashing and key equality.
//!
//! `ConcurrentHashMap` never calls `Hash`/`Eq` on keys directly; it asks its
//! `HashCompare` strategy. Implementations must keep `equal(a, b)` implying
//! `hash(a) == hash(b)`, otherwise lookups may miss present keys.

use core::hash::{BuildHasher, Hash};
use hashbrown::hash_map::DefaultHashBuilder;

/// Hashing and equality for keys of type `K`.
///
/// A strategy that supports borrowed lookups implements `HashCompare<Q>` for
/// each borrowed form `Q` and must hash `q` the same way it hashes any `k`
/// with `k.borrow() == q`.
pub trait HashCompare<K: ?Sized> {
    fn hash(&self, key: &K) -> u64;
    fn equal(&self, a: &K, b: &K) -> bool;
}

/// `HashCompare` backed by a `BuildHasher` and the key's own `Eq`.
#[derive(Clone, Debug, Default)]
pub struct DefaultHashCompare<S = DefaultHashBuilder> {
    build_hasher: S,
}

impl<S> DefaultHashCompare<S> {
    pub fn with_hasher(build_hasher: S) -> Self {
        Self { build_hasher }
    }

    pub fn hasher(&self) -> &S {
        &self.build_hasher
    }
}

impl<Q, S> HashCompare<Q> for DefaultHashCompare<S>
where
    Q: ?Sized + Hash + Eq,
    S: BuildHasher,
{
    #[inline]
    fn hash(&self, key: &Q) -> u64 {
        self.build_hasher.hash_one(key)
    }

    #[inline]
    fn equal(&self, a: &Q, b: &Q) -> bool {
        a == b
    }
}

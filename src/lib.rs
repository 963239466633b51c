//! accessor-hashmap: a concurrent hash map with per-bucket locking and
//! scoped accessors that keep an entry locked while it is in use.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: let many threads insert, look up, erase and traverse one map
//!   at once, with contention only between operations on the same bucket.
//! - Layers:
//!   - `Bucket`: a raw reader/writer lock over an ordered chain of
//!     entries. Each entry caches its hash and a per-bucket stamp.
//!   - `BucketArray`: power-of-two array of buckets with mask indexing and
//!     a generation counter bumped on every rebuild.
//!   - `ConcurrentHashMap<K, V, H>`: the array behind a table-level
//!     `RwLock`, an element counter and the `HashCompare` strategy.
//!   - `ConstAccessor` / `Accessor`: bindings to one entry holding its
//!     bucket shared / exclusive plus a pin on the array.
//!   - `Iter` / `Range`: weakly consistent traversal over a pinned array.
//!
//! Locking
//! - Every operation first pins the current array with a recursive shared
//!   read lock on the table, then locks one bucket. No operation holds two
//!   bucket locks at once; only user code holding several accessors can.
//! - Insertion locks the bucket exclusively for lookup and insertion
//!   together, so two threads inserting the same key agree on a single
//!   winner. Through a `ConstAccessor` the lock is then downgraded.
//! - Erasure unlinks under the lock and drops the entry after unlocking;
//!   `Drop` for `K`/`V` may re-enter the map.
//!
//! Growth
//! - Load factor 1, doubling, minimum 8 buckets. Growth runs at the start
//!   of an insertion, before any bucket lock, and only if the table write
//!   lock is free right now (`try_write`). Blocking here could wait on a
//!   pin held by the inserting thread itself or by a thread waiting on it.
//! - Anything pinning the array defers growth and raises a pending flag.
//!   Every pin (accessor binding, iterator, entry reference, range) checks
//!   the flag after releasing its read lock, so the last pin to go performs
//!   the growth. Catch-up sizes the array for the whole current length.
//! - Redistribution uses the cached hashes; user hashing never runs
//!   after insertion.
//!
//! Iteration
//! - Traversals pin the array and lock one bucket at a time, shared.
//!   Within a bucket the cursor is the last yielded stamp, so entries
//!   present throughout are yielded exactly once no matter what is
//!   erased or inserted meanwhile.
//! - `Range` splits the bucket span in halves down to a grainsize; with
//!   the `rayon` feature, `par_for_each` consumes it on the rayon pool.
//!
//! Reentrancy
//! - Debug builds record every bucket lock a thread holds and panic on a
//!   request that would wait on the thread itself. Release builds compile
//!   the check away.
//!
//! Notes and non-goals
//! - No duplicate keys; no ordering guarantees; no shrinking on erase.
//! - `len()` is exact only while no insertion or erasure is in flight.
//! - Accessors are `!Send`: a bucket lock is released on the thread
//!   that took it.

mod accessor;
mod bucket;
mod error;
mod hash_compare;
mod iter;
mod map;
mod map_proptest;
#[cfg(feature = "rayon")]
mod par;
mod reentrancy;
mod table;

// Public surface
pub use accessor::{Access, Accessor, ConstAccessor};
pub use error::{ReserveError, WouldBlock};
pub use hash_compare::{DefaultHashCompare, HashCompare};
pub use iter::{EntryRef, EqualRange, IntoIter, Iter, IterMut, Range};
pub use map::{swap, ConcurrentHashMap};

//! Divide-and-conquer traversal of a [`Range`] on the rayon pool.

use crate::iter::{EntryRef, Range};
use crate::map::ConcurrentHashMap;

impl<'a, K, V> Range<'a, K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    /// Split recursively down to the grainsize and run `op` on every entry
    /// of each leaf, leaves in parallel.
    ///
    /// Same consistency as [`Iter`](crate::Iter); `op` runs with the entry's
    /// bucket locked shared, so it must not write to the map through a key
    /// in that bucket.
    pub fn par_for_each<F>(self, op: F)
    where
        F: Fn(EntryRef<'_, K, V>) + Sync,
    {
        self.par_for_each_ref(&op);
    }

    fn par_for_each_ref<F>(mut self, op: &F)
    where
        F: Fn(EntryRef<'_, K, V>) + Sync,
    {
        if self.is_divisible() {
            let upper = self.split();
            rayon::join(|| self.par_for_each_ref(op), || upper.par_for_each_ref(op));
        } else {
            for e in self {
                op(e);
            }
        }
    }
}

impl<K, V, H> ConcurrentHashMap<K, V, H>
where
    K: Send + Sync,
    V: Send + Sync,
{
    /// `self.range(grainsize).par_for_each(op)`.
    pub fn par_for_each<F>(&self, grainsize: usize, op: F)
    where
        F: Fn(EntryRef<'_, K, V>) + Sync,
    {
        self.range(grainsize).par_for_each(op);
    }
}

#![cfg(test)]

// Property tests for ConcurrentHashMap kept inside the crate so they can
// observe the bucket array directly.

use crate::hash_compare::DefaultHashCompare;
use crate::map::ConcurrentHashMap;
use crate::{Accessor, ConstAccessor};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hasher};

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug)]
enum Op {
    Emplace(usize, i32),
    InsertDefault(usize),
    FindConst(usize),
    Update(usize, i32),
    Erase(usize),
    EraseAccessor(usize),
    Contains(String),
    Iterate,
    Rehash(usize),
    Clear,
}

fn key_from(pool: &[String], i: usize) -> Key {
    Key(pool[i].clone())
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<Op>)> {
    proptest::collection::vec("[a-z]{0,4}", 1..=12).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let op = prop_oneof![
            4 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Emplace(i, v)),
            1 => idx.clone().prop_map(Op::InsertDefault),
            2 => idx.clone().prop_map(Op::FindConst),
            2 => (idx.clone(), any::<i32>()).prop_map(|(i, d)| Op::Update(i, d)),
            2 => idx.clone().prop_map(Op::Erase),
            1 => idx.clone().prop_map(Op::EraseAccessor),
            1 => "[a-z]{0,4}".prop_map(Op::Contains),
            1 => Just(Op::Iterate),
            1 => (0usize..200).prop_map(Op::Rehash),
            1 => Just(Op::Clear),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (pool.clone(), ops))
    })
}

fn run_state_machine<H>(
    mut sut: ConcurrentHashMap<Key, i32, H>,
    pool: &[String],
    ops: Vec<Op>,
) -> Result<(), TestCaseError>
where
    H: crate::HashCompare<Key> + crate::HashCompare<str>,
{
    let mut model: HashMap<Key, i32> = HashMap::new();

    for op in ops {
        match op {
            Op::Emplace(i, v) => {
                let k = key_from(pool, i);
                let mut acc = ConstAccessor::new();
                let inserted = sut.emplace(&mut acc, k.clone(), v);
                prop_assert_eq!(inserted, !model.contains_key(&k));
                let stored = *model.entry(k.clone()).or_insert(v);
                prop_assert_eq!(acc.key(), &k);
                prop_assert_eq!(*acc.value(), stored);
            }
            Op::InsertDefault(i) => {
                let k = key_from(pool, i);
                let inserted = sut.insert_key(k.clone());
                prop_assert_eq!(inserted, !model.contains_key(&k));
                model.entry(k).or_insert(0);
            }
            Op::FindConst(i) => {
                let k = key_from(pool, i);
                let mut acc = ConstAccessor::new();
                let found = sut.find(&mut acc, &k);
                prop_assert_eq!(found, model.contains_key(&k));
                prop_assert_eq!(acc.get().map(|(_, v)| *v), model.get(&k).copied());
            }
            Op::Update(i, d) => {
                let k = key_from(pool, i);
                let mut acc = Accessor::new();
                if sut.find(&mut acc, k.0.as_str()) {
                    let next = acc.saturating_add(d);
                    *acc = next;
                    let mv = model.get_mut(&k).expect("present in model");
                    *mv = mv.saturating_add(d);
                } else {
                    prop_assert!(!model.contains_key(&k));
                }
            }
            Op::Erase(i) => {
                let k = key_from(pool, i);
                prop_assert_eq!(sut.erase(&k), model.remove(&k).is_some());
            }
            Op::EraseAccessor(i) => {
                let k = key_from(pool, i);
                let mut acc = Accessor::new();
                if sut.find(&mut acc, &k) {
                    prop_assert!(sut.erase_accessor(&mut acc));
                    prop_assert!(acc.is_empty());
                    prop_assert!(model.remove(&k).is_some());
                } else {
                    prop_assert!(!model.contains_key(&k));
                }
            }
            Op::Contains(s) => {
                let has_model = model.keys().any(|k| k.0 == s);
                prop_assert_eq!(sut.contains_key(s.as_str()), has_model);
                prop_assert_eq!(sut.count(s.as_str()), usize::from(has_model));
            }
            Op::Iterate => {
                let mut seen = BTreeMap::new();
                for e in sut.iter() {
                    let prev = seen.insert(e.key().clone(), *e.value());
                    prop_assert!(prev.is_none(), "iteration repeated a key");
                }
                let want: BTreeMap<_, _> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
                prop_assert_eq!(seen, want);
            }
            Op::Rehash(n) => {
                let gen_before = sut.generation();
                let before = sut.bucket_count();
                sut.rehash(n).expect("rehash to a small target");
                let after = sut.bucket_count();
                prop_assert!(after.is_power_of_two());
                prop_assert!(after >= n && after > sut.len());
                if after != before {
                    prop_assert!(sut.generation() > gen_before);
                }
            }
            Op::Clear => {
                let buckets = sut.bucket_count();
                sut.clear();
                model.clear();
                prop_assert_eq!(sut.bucket_count(), buckets);
            }
        }

        // Post-conditions after each op
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
        prop_assert!(sut.bucket_count().is_power_of_two());
    }

    // Owned traversal drains exactly the model.
    let drained: BTreeSet<(Key, i32)> = sut.into_iter().collect();
    let want: BTreeSet<(Key, i32)> = model.into_iter().collect();
    prop_assert_eq!(drained, want);
    Ok(())
}

// Property: state-machine equivalence against std::collections::HashMap.
// Invariants exercised across random operation sequences:
// - insert/emplace report "inserted" iff the key was absent; first writer wins.
// - accessor-bound lookups see the model's value; updates through `Accessor` stick.
// - erase by key and by accessor remove exactly one entry.
// - `iter` yields each live entry exactly once with its current value.
// - `rehash` keeps every entry and respects the load factor; `clear` keeps buckets.
// - `len`/`is_empty` parity with the model after each op.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_state_machine(ConcurrentHashMap::new(), &pool, ops)?;
    }

    #[test]
    fn prop_state_machine_collisions((pool, ops) in arb_scenario()) {
        let sut = ConcurrentHashMap::with_hash_compare(DefaultHashCompare::with_hasher(ConstBuildHasher));
        run_state_machine(sut, &pool, ops)?;
    }
}

// Collision variant using a constant hasher to stress equality resolution.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

// Property: clones are independent and equal to their source at clone time.
proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]
    #[test]
    fn prop_clone_is_deep(entries in proptest::collection::vec((0u16..64, any::<i32>()), 0..64), extra in 64u16..128) {
        let a: ConcurrentHashMap<u16, i32> = entries.iter().copied().collect();
        let b = a.clone();
        prop_assert!(a == b);
        prop_assert_eq!(b.len(), a.len());
        b.insert_value(extra, 0);
        prop_assert!(a != b);
        prop_assert_eq!(a.count(&extra), 0);
    }
}

use std::collections::btree_map;
use std::collections::hash_map;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::{BuildHasher, Hash};

use rustc_hash::{FxBuildHasher, FxHashMap};

/// Trait for inserting a key-value pair that must not exist yet.
pub trait MapInsertNew<K, V> {
    /// Inserts a new key-value pair into the map.
    ///
    /// # Panics
    /// Panics if the key is already present in the map.
    fn insert_new(&mut self, key: K, value: V);
}

impl<K, V, H> MapInsertNew<K, V> for HashMap<K, V, H>
where
    K: Eq + Hash + Debug,
    V: Debug,
    H: BuildHasher,
{
    #[inline]
    fn insert_new(&mut self, key: K, value: V) {
        match self.entry(key) {
            hash_map::Entry::Occupied(occupied) => panic!(
                "can not insert value {value:?}, because there is already an entry ({:?}, {:?})",
                occupied.key(),
                occupied.get()
            ),
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(value);
            }
        }
    }
}

impl<K, V> MapInsertNew<K, V> for BTreeMap<K, V>
where
    K: Ord + Debug,
    V: Debug,
{
    #[inline]
    fn insert_new(&mut self, key: K, value: V) {
        match self.entry(key) {
            btree_map::Entry::Occupied(occupied) => panic!(
                "can not insert value {value:?}, because there is already an entry ({:?}, {:?})",
                occupied.key(),
                occupied.get()
            ),
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(value);
            }
        }
    }
}

/// Trait for objects that can be created with a given capacity.
pub trait WithCapacity {
    fn with_capacity(capacity: usize) -> Self;
}

impl<K, V> WithCapacity for FxHashMap<K, V> {
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        FxHashMap::with_capacity_and_hasher(capacity, FxBuildHasher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_new() {
        let mut hm = FxHashMap::default();
        hm.insert_new(1, 2);
        hm.insert_new(2, 4);
        assert_eq!(hm[&1], 2);
        assert_eq!(hm[&2], 4);
    }

    #[test]
    #[should_panic(expected = "can not insert value 4, because there is already an entry (1, 2)")]
    fn test_insert_new_panic() {
        let mut hm = BTreeMap::new();
        hm.insert_new(1, 2);
        hm.insert_new(1, 4);
    }

    #[test]
    fn test_with_capacity() {
        let hm = FxHashMap::<char, usize>::with_capacity(10);
        assert!(hm.capacity() >= 10);
    }
}

//! Direct-mapped memoization cache.
//!
//! Turns a hash-map lookup on the per-packet path into an index into a
//! small fixed array for the common case of consecutive packets from
//! the same handful of flows. Collisions simply re-evaluate.

use std::hash::{BuildHasher, Hash};

pub struct FlatCache<K, V, const N: usize> {
    entries: [Option<(K, V)>; N],
    hasher: ahash::RandomState,
}

impl<K: Hash + Eq + Copy, V: Copy, const N: usize> FlatCache<K, V, N> {
    pub fn new() -> Self {
        const { assert!(N.is_power_of_two()) };
        Self {
            entries: [None; N],
            hasher: ahash::RandomState::new(),
        }
    }

    fn index(&self, key: &K) -> usize {
        self.hasher.hash_one(key) as usize & (N - 1)
    }

    /// Returns the cached value for `key`, evaluating `f` on a miss.
    pub fn call(&mut self, key: K, f: impl FnOnce(&K) -> V) -> V {
        let idx = self.index(&key);
        if let Some((cached, value)) = &self.entries[idx] {
            if *cached == key {
                return *value;
            }
        }

        let value = f(&key);
        self.entries[idx] = Some((key, value));
        value
    }

    /// Re-evaluates `f` and replaces whatever the slot held; used after
    /// the caller has changed the underlying mapping.
    pub fn retry(&mut self, key: K, f: impl FnOnce(&K) -> V) -> V {
        let idx = self.index(&key);
        let value = f(&key);
        self.entries[idx] = Some((key, value));
        value
    }
}

impl<K: Hash + Eq + Copy, V: Copy, const N: usize> Default for FlatCache<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

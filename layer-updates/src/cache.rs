//! Bounded, insertion-ordered cache with batch eviction.
//!
//! Used for recently seen messages and business connections. Writing a key
//! moves it to the back of the eviction order; reading does not. Once the
//! cache grows past its capacity, the oldest `capacity / 2 + 1` entries are
//! dropped in one go, so eviction happens every few hundred inserts instead of
//! on every insert past the bound.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Fixed-capacity key → value store. Not an LRU: reads never refresh.
#[derive(Debug)]
pub struct Cache<K, V> {
    capacity: usize,
    entries:  HashMap<K, (u64, V)>,
    /// Insertion sequence → key, oldest first.
    order:    BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries:  HashMap::new(),
            order:    BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Returns a clone of the stored value, or `None`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|(_, v)| v.clone())
    }

    /// Insert or replace `key`, then evict if the bound was exceeded.
    pub fn set(&mut self, key: K, value: V) {
        if let Some((seq, _)) = self.entries.remove(&key) {
            self.order.remove(&seq);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key, (seq, value));

        if self.entries.len() > self.capacity {
            self.evict(self.capacity / 2 + 1);
        }
    }

    fn evict(&mut self, count: usize) {
        for _ in 0..count {
            match self.order.pop_first() {
                Some((_, key)) => { self.entries.remove(&key); }
                None           => break,
            }
        }
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn capacity(&self) -> usize { self.capacity }
}

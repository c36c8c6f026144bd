//! Reference-counted map keyed by a remote identity.
//!
//! An entry is created by the first `link`, incremented by every further
//! `link`, and removed by the `unlink` that brings its count to zero. A key is
//! present exactly when its count is positive.

use std::collections::btree_map::{self, BTreeMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    Incremented(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlinkOutcome<V> {
    Decremented(usize),
    Removed(V),
    Absent,
}

#[derive(Debug)]
struct Counted<V> {
    count: usize,
    value: V,
}

#[derive(Debug)]
pub struct RefCountMap<K, V> {
    entries: BTreeMap<K, Counted<V>>,
}

impl<K: Ord, V> Default for RefCountMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> RefCountMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one reference on `key`, creating the entry with `init` when it
    /// does not exist yet.
    pub fn link(&mut self, key: K, init: impl FnOnce() -> V) -> LinkOutcome {
        match self.entries.entry(key) {
            btree_map::Entry::Occupied(mut entry) => {
                let counted = entry.get_mut();
                counted.count += 1;
                LinkOutcome::Incremented(counted.count)
            }
            btree_map::Entry::Vacant(entry) => {
                entry.insert(Counted {
                    count: 1,
                    value: init(),
                });
                LinkOutcome::Created
            }
        }
    }

    pub fn unlink(&mut self, key: &K) -> UnlinkOutcome<V> {
        let Some(counted) = self.entries.get_mut(key) else {
            return UnlinkOutcome::Absent;
        };
        if counted.count > 1 {
            counted.count -= 1;
            return UnlinkOutcome::Decremented(counted.count);
        }
        match self.entries.remove(key) {
            Some(counted) => UnlinkOutcome::Removed(counted.value),
            None => UnlinkOutcome::Absent,
        }
    }

    pub fn count(&self, key: &K) -> usize {
        self.entries.get(key).map(|c| c.count).unwrap_or(0)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|c| &c.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|c| &mut c.value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.entries.iter_mut().map(|(k, c)| (k, &mut c.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

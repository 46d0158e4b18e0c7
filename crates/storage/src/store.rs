use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keyed access to one kind of entity.
pub trait EntityStore<K, V> {
    fn find(&self, key: &K) -> Option<&V>;
    fn find_mut(&mut self, key: &K) -> Option<&mut V>;
    fn insert(&mut self, key: K, value: V) -> Option<V>;
    fn remove(&mut self, key: &K) -> Option<V>;
    fn len(&self) -> usize;

    fn contains(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered in-memory entity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryStore<K: Ord, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V> MemoryStore<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable access, creating the value with `init` when absent.
    pub fn get_or_insert_with(&mut self, key: K, init: impl FnOnce() -> V) -> &mut V {
        self.entries.entry(key).or_insert_with(init)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Ord + Clone, V> EntityStore<K, V> for MemoryStore<K, V> {
    fn find(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for MemoryStore<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

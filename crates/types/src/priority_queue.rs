use crate::Key;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorityPair {
    pub key: Key,
    pub priority: f64,
}

impl PartialEq for PriorityPair {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityPair {}

impl PartialOrd for PriorityPair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityPair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Max-priority queue of drives waiting for replicators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityQueueEntry {
    pub key: Key,
    pub heap: BinaryHeap<PriorityPair>,
}

impl PriorityQueueEntry {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, pair: PriorityPair) {
        self.heap.push(pair);
    }

    pub fn pop(&mut self) -> Option<PriorityPair> {
        self.heap.pop()
    }

    /// Insert or replace the priority of `key`.
    pub fn set(&mut self, key: Key, priority: f64) {
        self.remove(&key);
        self.heap.push(PriorityPair { key, priority });
    }

    pub fn remove(&mut self, key: &Key) {
        self.heap.retain(|pair| pair.key != *key);
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.heap.iter().any(|pair| pair.key == *key)
    }

    pub fn priority_of(&self, key: &Key) -> Option<f64> {
        self.heap
            .iter()
            .find(|pair| pair.key == *key)
            .map(|pair| pair.priority)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

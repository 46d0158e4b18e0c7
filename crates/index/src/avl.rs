//! Order-statistics AVL tree.
//!
//! Keys are ordered by `AvlTreeStore::ordering_key`, which must be unique per
//! key and must not change while the key is in the tree. Every node keeps its
//! subtree height and size, giving O(log n) rank queries and removal by rank.

use drivenet_types::{AvlTreeNode, Key};
use std::cmp::Ordering;

/// Storage seam for the tree: ordering, node fields and the persisted root.
pub trait AvlTreeStore {
    type Ordering: Ord;

    fn ordering_key(&self, key: &Key) -> Self::Ordering;
    fn load_node(&self, key: &Key) -> AvlTreeNode;
    fn save_node(&mut self, key: &Key, node: AvlTreeNode);
    fn root(&self) -> Key;
    fn set_root(&mut self, root: Key);
}

pub struct AvlTree<S> {
    store: S,
}

impl<S: AvlTreeStore> AvlTree<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    pub fn size(&self) -> u32 {
        self.node(&self.store.root()).size
    }

    pub fn is_empty(&self) -> bool {
        self.store.root().is_zero()
    }

    /// Insert `key`; its node fields are reset to a fresh leaf first.
    pub fn insert(&mut self, key: Key) {
        if key.is_zero() {
            return;
        }
        let ordering = self.store.ordering_key(&key);
        let root = self.store.root();
        let root = self.insert_at(root, key, &ordering);
        self.store.set_root(root);
    }

    /// Remove the key ordered as `ordering`. Returns the removed key.
    pub fn remove(&mut self, ordering: &S::Ordering) -> Option<Key> {
        let root = self.store.root();
        let (root, removed) = self.remove_at(root, ordering);
        self.store.set_root(root);
        removed
    }

    /// Remove `key` if it is present in the tree.
    pub fn remove_key(&mut self, key: &Key) -> bool {
        let ordering = self.store.ordering_key(key);
        matches!(self.remove(&ordering), Some(found) if found == *key)
    }

    pub fn contains(&self, ordering: &S::Ordering) -> bool {
        let mut current = self.store.root();
        while !current.is_zero() {
            let node = self.node(&current);
            match ordering.cmp(&self.store.ordering_key(&current)) {
                Ordering::Less => current = node.left,
                Ordering::Greater => current = node.right,
                Ordering::Equal => return true,
            }
        }
        false
    }

    /// First key not ordered before `ordering`, or the zero key.
    pub fn lower_bound(&self, ordering: &S::Ordering) -> Key {
        let mut current = self.store.root();
        let mut candidate = Key::ZERO;
        while !current.is_zero() {
            let node = self.node(&current);
            if self.store.ordering_key(&current) < *ordering {
                current = node.right;
            } else {
                candidate = current;
                current = node.left;
            }
        }
        candidate
    }

    /// Number of keys ordered strictly before `ordering`.
    pub fn number_of_less(&self, ordering: &S::Ordering) -> u32 {
        let mut current = self.store.root();
        let mut count = 0;
        while !current.is_zero() {
            let node = self.node(&current);
            if self.store.ordering_key(&current) < *ordering {
                count += self.node(&node.left).size + 1;
                current = node.right;
            } else {
                current = node.left;
            }
        }
        count
    }

    /// Key at 0-based `rank` without removing it.
    pub fn select(&self, mut rank: u32) -> Option<Key> {
        let mut current = self.store.root();
        while !current.is_zero() {
            let node = self.node(&current);
            let left_size = self.node(&node.left).size;
            match rank.cmp(&left_size) {
                Ordering::Less => current = node.left,
                Ordering::Equal => return Some(current),
                Ordering::Greater => {
                    rank -= left_size + 1;
                    current = node.right;
                }
            }
        }
        None
    }

    /// Remove and return the key at 0-based `rank`.
    pub fn extract(&mut self, rank: u32) -> Option<Key> {
        let key = self.select(rank)?;
        let ordering = self.store.ordering_key(&key);
        self.remove(&ordering)
    }

    /// In-order traversal.
    pub fn keys(&self) -> Vec<Key> {
        let mut out = Vec::with_capacity(self.size() as usize);
        let mut stack = Vec::new();
        let mut current = self.store.root();
        while !current.is_zero() || !stack.is_empty() {
            while !current.is_zero() {
                stack.push(current);
                current = self.node(&current).left;
            }
            if let Some(key) = stack.pop() {
                out.push(key);
                current = self.node(&key).right;
            }
        }
        out
    }

    /// Verify balance factors, heights, sizes and key ordering of every node.
    pub fn check_tree_validity(&self) -> bool {
        let keys = self.keys();
        let ordered = keys.windows(2).all(|pair| {
            self.store.ordering_key(&pair[0]) < self.store.ordering_key(&pair[1])
        });
        ordered && self.check_subtree(&self.store.root()).is_some()
    }

    fn check_subtree(&self, key: &Key) -> Option<(u32, u32)> {
        if key.is_zero() {
            return Some((0, 0));
        }
        let node = self.node(key);
        let (left_height, left_size) = self.check_subtree(&node.left)?;
        let (right_height, right_size) = self.check_subtree(&node.right)?;
        let balanced = left_height.abs_diff(right_height) <= 1;
        let height = left_height.max(right_height) + 1;
        let size = left_size + right_size + 1;
        (balanced && node.height == height && node.size == size).then_some((height, size))
    }

    fn node(&self, key: &Key) -> AvlTreeNode {
        if key.is_zero() {
            AvlTreeNode::default()
        } else {
            self.store.load_node(key)
        }
    }

    fn insert_at(&mut self, current: Key, key: Key, ordering: &S::Ordering) -> Key {
        if current.is_zero() {
            self.store.save_node(&key, AvlTreeNode::leaf());
            return key;
        }
        let mut node = self.node(&current);
        if *ordering < self.store.ordering_key(&current) {
            node.left = self.insert_at(node.left, key, ordering);
        } else {
            node.right = self.insert_at(node.right, key, ordering);
        }
        self.store.save_node(&current, node);
        self.rebalance(current)
    }

    fn remove_at(&mut self, current: Key, ordering: &S::Ordering) -> (Key, Option<Key>) {
        if current.is_zero() {
            return (Key::ZERO, None);
        }
        let mut node = self.node(&current);
        match ordering.cmp(&self.store.ordering_key(&current)) {
            Ordering::Less => {
                let (left, removed) = self.remove_at(node.left, ordering);
                node.left = left;
                self.store.save_node(&current, node);
                (self.rebalance(current), removed)
            }
            Ordering::Greater => {
                let (right, removed) = self.remove_at(node.right, ordering);
                node.right = right;
                self.store.save_node(&current, node);
                (self.rebalance(current), removed)
            }
            Ordering::Equal => {
                self.store.save_node(&current, AvlTreeNode::default());
                if node.left.is_zero() {
                    return (node.right, Some(current));
                }
                if node.right.is_zero() {
                    return (node.left, Some(current));
                }
                let (right, successor) = self.detach_min(node.right);
                let mut replacement = self.node(&successor);
                replacement.left = node.left;
                replacement.right = right;
                self.store.save_node(&successor, replacement);
                (self.rebalance(successor), Some(current))
            }
        }
    }

    /// Unlink the leftmost node of the subtree; returns (new subtree root, detached key).
    fn detach_min(&mut self, current: Key) -> (Key, Key) {
        let mut node = self.node(&current);
        if node.left.is_zero() {
            return (node.right, current);
        }
        let (left, min) = self.detach_min(node.left);
        node.left = left;
        self.store.save_node(&current, node);
        (self.rebalance(current), min)
    }

    fn update(&mut self, key: &Key) {
        let mut node = self.node(key);
        let left = self.node(&node.left);
        let right = self.node(&node.right);
        node.height = left.height.max(right.height) + 1;
        node.size = left.size + right.size + 1;
        self.store.save_node(key, node);
    }

    fn height(&self, key: &Key) -> u32 {
        self.node(key).height
    }

    fn rebalance(&mut self, key: Key) -> Key {
        self.update(&key);
        let node = self.node(&key);
        let left_height = self.height(&node.left);
        let right_height = self.height(&node.right);

        if left_height > right_height + 1 {
            let left = self.node(&node.left);
            if self.height(&left.left) >= self.height(&left.right) {
                self.rotate_right(key)
            } else {
                let pivot = self.rotate_left(node.left);
                let mut node = self.node(&key);
                node.left = pivot;
                self.store.save_node(&key, node);
                self.rotate_right(key)
            }
        } else if right_height > left_height + 1 {
            let right = self.node(&node.right);
            if self.height(&right.right) >= self.height(&right.left) {
                self.rotate_left(key)
            } else {
                let pivot = self.rotate_right(node.right);
                let mut node = self.node(&key);
                node.right = pivot;
                self.store.save_node(&key, node);
                self.rotate_left(key)
            }
        } else {
            key
        }
    }

    // LL case
    fn rotate_right(&mut self, key: Key) -> Key {
        let mut node = self.node(&key);
        let pivot_key = node.left;
        let mut pivot = self.node(&pivot_key);
        node.left = pivot.right;
        self.store.save_node(&key, node);
        self.update(&key);

        pivot.right = key;
        self.store.save_node(&pivot_key, pivot);
        self.update(&pivot_key);
        pivot_key
    }

    // RR case
    fn rotate_left(&mut self, key: Key) -> Key {
        let mut node = self.node(&key);
        let pivot_key = node.right;
        let mut pivot = self.node(&pivot_key);
        node.right = pivot.left;
        self.store.save_node(&key, node);
        self.update(&key);

        pivot.left = key;
        self.store.save_node(&pivot_key, pivot);
        self.update(&pivot_key);
        pivot_key
    }
}

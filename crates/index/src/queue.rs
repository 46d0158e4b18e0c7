//! FIFO queue threaded through entity-embedded `previous`/`next` links.

use drivenet_types::{Key, QueueEntry, QueueLink};

/// Storage seam for the queue: its head record and per-entity links.
pub trait QueueStore {
    fn head(&self) -> QueueEntry;
    fn set_head(&mut self, head: QueueEntry);
    fn load_link(&self, key: &Key) -> QueueLink;
    fn save_link(&mut self, key: &Key, link: QueueLink);
}

pub struct IndexedQueue<S> {
    store: S,
}

impl<S: QueueStore> IndexedQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    pub fn is_empty(&self) -> bool {
        self.store.head().first.is_zero()
    }

    pub fn len(&self) -> u32 {
        self.store.head().size
    }

    /// Front key, or the zero key when empty.
    pub fn front(&self) -> Key {
        self.store.head().first
    }

    pub fn back(&self) -> Key {
        self.store.head().last
    }

    pub fn contains(&self, key: &Key) -> bool {
        !key.is_zero()
            && (self.store.head().first == *key || !self.store.load_link(key).previous.is_zero())
    }

    pub fn push_back(&mut self, key: Key) {
        if key.is_zero() || self.contains(&key) {
            tracing::debug!(key = %key, "Ignoring push of key already queued");
            return;
        }
        let mut head = self.store.head();
        if head.last.is_zero() {
            head.first = key;
            self.store.save_link(&key, QueueLink::default());
        } else {
            let mut tail = self.store.load_link(&head.last);
            tail.next = key;
            self.store.save_link(&head.last, tail);
            self.store.save_link(
                &key,
                QueueLink {
                    previous: head.last,
                    next: Key::ZERO,
                },
            );
        }
        head.last = key;
        head.size += 1;
        self.store.set_head(head);
    }

    pub fn pop_front(&mut self) -> Option<Key> {
        let front = self.front();
        if front.is_zero() {
            return None;
        }
        self.remove(&front);
        Some(front)
    }

    /// Unlink `key`, patching both neighbours and the head. Returns false if absent.
    pub fn remove(&mut self, key: &Key) -> bool {
        if !self.contains(key) {
            return false;
        }
        let link = self.store.load_link(key);
        let mut head = self.store.head();

        if link.previous.is_zero() {
            head.first = link.next;
        } else {
            let mut previous = self.store.load_link(&link.previous);
            previous.next = link.next;
            self.store.save_link(&link.previous, previous);
        }

        if link.next.is_zero() {
            head.last = link.previous;
        } else {
            let mut next = self.store.load_link(&link.next);
            next.previous = link.previous;
            self.store.save_link(&link.next, next);
        }

        self.store.save_link(key, QueueLink::default());
        head.size = head.size.saturating_sub(1);
        self.store.set_head(head);
        true
    }

    /// Keys from front to back.
    pub fn keys(&self) -> Vec<Key> {
        let mut out = Vec::with_capacity(self.len() as usize);
        let mut current = self.front();
        while !current.is_zero() {
            out.push(current);
            current = self.store.load_link(&current).next;
        }
        out
    }
}

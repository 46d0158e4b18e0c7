//! Persistent index structures over keyed entity storage.
//!
//! Neither structure owns its nodes: the AVL node fields and queue links are
//! embedded in the entities and reached through the [`AvlTreeStore`] and
//! [`QueueStore`] seams, so node identity is entity identity and the zero key
//! is the null pointer.

pub mod avl;
pub mod queue;

pub use avl::{AvlTree, AvlTreeStore};
pub use queue::{IndexedQueue, QueueStore};

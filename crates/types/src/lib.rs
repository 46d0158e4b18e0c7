//! Entity and identifier types shared by the drivenet storage crates.
//!
//! Drives, replicators and download channels embed the AVL and queue node
//! fields that the index crate threads through them.

pub mod download_channel;
pub mod drive;
pub mod index_nodes;
pub mod key;
pub mod priority_queue;
pub mod receipt;
pub mod replicator;
pub mod scalars;

pub use download_channel::*;
pub use drive::*;
pub use index_nodes::*;
pub use key::*;
pub use priority_queue::*;
pub use receipt::*;
pub use replicator::*;
pub use scalars::*;

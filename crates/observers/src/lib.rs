//! Storage-network state machine.
//!
//! Each block feeds [`StorageNotification`]s through [`StorageObservers`],
//! which assigns replicators to drives, splits them into shards, runs
//! verifications and settles storage, download and upload payments. Every
//! random choice is drawn from a ChaCha20 stream seeded by the block's
//! generation hash, so all nodes reach the same state.

pub mod adapters;
pub mod assignment;
pub mod closure;
pub mod config;
pub mod context;
pub mod deposits;
pub mod dispatcher;
pub mod download;
pub mod drive;
pub mod error;
pub mod liquidity;
pub mod modification;
pub mod notifications;
pub mod priority;
pub mod replicator;
pub mod rng;
pub mod service;
pub mod sharding;
pub mod storage_payment;
pub mod stream;
pub mod verification;

#[cfg(test)]
mod test_support;

pub use config::StorageConfig;
pub use context::{BlockContext, NotifyMode, ObserverContext};
pub use dispatcher::{BlockOutcome, StorageObservers};
pub use error::{ObserverError, Result};
pub use liquidity::{DirectExchange, LiquidityProvider};
pub use notifications::StorageNotification;
pub use service::{
    DriveSnapshot, ServiceNotification, ServiceNotificationSink, StorageUpdatesListener,
};

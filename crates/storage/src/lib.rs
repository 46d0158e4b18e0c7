//! Storage layer for the drivenet state machine.
//!
//! Entities live in ordered in-memory stores while a block is processed;
//! [`SledStateStore`] persists the resulting state between runs.

pub mod ledger;
pub mod sled_store;
pub mod state;
pub mod store;

pub use ledger::{AccountLedger, InMemoryAccountLedger};
pub use sled_store::SledStateStore;
pub use state::StorageState;
pub use store::{EntityStore, MemoryStore};

use drivenet_types::{Amount, Key, MosaicId};

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Insufficient balance of mosaic {mosaic} on {account}: {balance} < {amount}")]
    InsufficientBalance {
        account: Key,
        mosaic: MosaicId,
        balance: Amount,
        amount: Amount,
    },
    #[error("Balance overflow of mosaic {mosaic} on {account}: {balance} + {amount}")]
    BalanceOverflow {
        account: Key,
        mosaic: MosaicId,
        balance: Amount,
        amount: Amount,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

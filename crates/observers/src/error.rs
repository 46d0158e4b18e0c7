//! Error types for storage observers

use drivenet_storage::StorageError;
use drivenet_types::{Hash256, Key};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("Invalid observer mode ROLLBACK ({0})")]
    InvalidObserverMode(&'static str),

    #[error("Drive not found: {0}")]
    DriveNotFound(Key),

    #[error("Replicator not found: {0}")]
    ReplicatorNotFound(Key),

    #[error("Download channel not found: {0}")]
    DownloadChannelNotFound(Hash256),

    #[error("Download channel already exists: {0}")]
    DownloadChannelExists(Hash256),

    #[error("Drive already exists: {0}")]
    DriveExists(Key),

    #[error("Replicator already exists: {0}")]
    ReplicatorExists(Key),

    #[error("Drive info of {drive} not found in replicator {replicator}")]
    DriveInfoNotFound { replicator: Key, drive: Key },

    #[error("Data modification {id} not found on drive {drive}")]
    ModificationNotFound { drive: Key, id: Hash256 },

    #[error("Data modification {id} is not the first active modification of drive {drive}")]
    ModificationNotFirst { drive: Key, id: Hash256 },

    #[error("Data modification {id} on drive {drive} is not ready for approval")]
    ModificationNotReady { drive: Key, id: Hash256 },

    #[error("Streaming deposit slashing exceeds streaming deposit: {deposit} < {slashing}")]
    SlashingExceedsDeposit { deposit: u64, slashing: u64 },

    #[error("No verification in progress on drive {0}")]
    NoVerification(Key),

    #[error("Verification trigger mismatch on drive {0}")]
    VerificationTriggerMismatch(Key),

    #[error("Invalid shard {shard} of drive {drive}")]
    InvalidShard { drive: Key, shard: u16 },

    #[error("Malformed opinions: {0}")]
    MalformedOpinions(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, ObserverError>;

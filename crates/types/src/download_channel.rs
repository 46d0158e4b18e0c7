use crate::{Amount, Hash256, Key, QueueLink, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Consumer-funded retrieval channel attached to a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChannelEntry {
    pub id: Hash256,
    pub consumer: Key,
    pub drive: Key,
    pub download_size_mb: u64,
    /// Remaining periodic approval rounds.
    pub download_approval_count_left: u16,
    pub list_of_public_keys: Vec<Key>,
    pub shard_replicators: BTreeSet<Key>,
    /// Amount already paid to each replicator that ever served the channel.
    pub cumulative_payments: BTreeMap<Key, Amount>,
    pub finish_published: bool,
    pub last_download_approval_initiated: Timestamp,
    pub download_approval_initiation_event: Hash256,
    pub payment_link: QueueLink,
}

impl DownloadChannelEntry {
    pub fn new(id: Hash256, consumer: Key, drive: Key, download_size_mb: u64) -> Self {
        Self {
            id,
            consumer,
            drive,
            download_size_mb,
            download_approval_count_left: 1,
            list_of_public_keys: Vec::new(),
            shard_replicators: BTreeSet::new(),
            cumulative_payments: BTreeMap::new(),
            finish_published: false,
            last_download_approval_initiated: Timestamp::default(),
            download_approval_initiation_event: Hash256::ZERO,
            payment_link: QueueLink::default(),
        }
    }

    /// Queue key of the channel; channel ids share the 32-byte key space.
    pub fn queue_key(&self) -> Key {
        Key::from(self.id)
    }
}

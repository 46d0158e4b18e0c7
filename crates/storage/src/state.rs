use crate::{InMemoryAccountLedger, MemoryStore};
use drivenet_types::{
    DownloadChannelEntry, DriveEntry, Hash256, Key, PriorityQueueEntry, QueueEntry,
    ReplicatorEntry, WellKnownKey,
};
use serde::{Deserialize, Serialize};

/// Complete storage-network state advanced by block notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageState {
    pub drives: MemoryStore<Key, DriveEntry>,
    pub replicators: MemoryStore<Key, ReplicatorEntry>,
    pub download_channels: MemoryStore<Hash256, DownloadChannelEntry>,
    /// Queue and tree heads keyed by their well-known key.
    pub queues: MemoryStore<Key, QueueEntry>,
    pub priority_queues: MemoryStore<Key, PriorityQueueEntry>,
    pub accounts: InMemoryAccountLedger,
}

impl StorageState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Head record of a well-known queue or tree, created empty on first use.
    pub fn queue_entry(&mut self, which: WellKnownKey) -> &mut QueueEntry {
        let key = which.key();
        self.queues.get_or_insert_with(key, || QueueEntry::new(key))
    }

    pub fn priority_queue(&mut self, which: WellKnownKey) -> &mut PriorityQueueEntry {
        let key = which.key();
        self.priority_queues
            .get_or_insert_with(key, || PriorityQueueEntry::new(key))
    }

    /// BLAKE3 digest over the canonical JSON encoding; identical on every replaying node.
    pub fn state_hash(&self) -> crate::Result<Hash256> {
        let bytes = serde_json::to_vec(self)?;
        Ok(Hash256::digest(&bytes))
    }
}

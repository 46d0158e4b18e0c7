use crate::{AvlTreeNode, Hash256, Key, QueueLink, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Data modification that has been requested but not yet approved or cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDataModification {
    pub id: Hash256,
    pub owner: Key,
    pub download_data_cdi: Hash256,
    pub expected_upload_size_mb: u64,
    pub actual_upload_size_mb: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub folder_name: String,
    pub ready_for_approval: bool,
    pub is_stream: bool,
    /// Streaming units the owner locked on the drive for this modification.
    #[serde(default)]
    pub prepaid_streaming_units: u64,
}

impl ActiveDataModification {
    /// Regular modification; ready for approval as soon as it is queued.
    pub fn new(id: Hash256, owner: Key, download_data_cdi: Hash256, upload_size_mb: u64) -> Self {
        Self {
            id,
            owner,
            download_data_cdi,
            expected_upload_size_mb: upload_size_mb,
            actual_upload_size_mb: upload_size_mb,
            folder_name: String::new(),
            ready_for_approval: true,
            is_stream: false,
            prepaid_streaming_units: 0,
        }
    }

    /// Stream modification; becomes ready once the stream is finished.
    pub fn stream(id: Hash256, owner: Key, expected_upload_size_mb: u64, folder_name: String) -> Self {
        Self {
            id,
            owner,
            download_data_cdi: Hash256::ZERO,
            expected_upload_size_mb,
            actual_upload_size_mb: 0,
            folder_name,
            ready_for_approval: false,
            is_stream: true,
            prepaid_streaming_units: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataModificationApprovalState {
    Approved,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedDataModification {
    #[serde(flatten)]
    pub modification: ActiveDataModification,
    pub state: DataModificationApprovalState,
}

impl CompletedDataModification {
    pub fn is_approved(&self) -> bool {
        self.state == DataModificationApprovalState::Approved
    }
}

/// Confirmed-storage accounting of a single replicator on a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfirmedStorageInfo {
    /// Accumulated milliseconds since the last storage payment.
    pub time_in_confirmed_storage: u64,
    /// Set while the replicator holds the drive's current state.
    pub confirmed_storage_since: Option<Timestamp>,
}

impl ConfirmedStorageInfo {
    pub fn started_at(now: Timestamp) -> Self {
        Self {
            time_in_confirmed_storage: 0,
            confirmed_storage_since: Some(now),
        }
    }

    /// Fold the running interval into the accumulated time and restart it at `now`.
    pub fn accumulate(&mut self, now: Timestamp) {
        if let Some(since) = self.confirmed_storage_since {
            self.time_in_confirmed_storage = self
                .time_in_confirmed_storage
                .saturating_add(now.millis_since(since));
            self.confirmed_storage_since = Some(now);
        }
    }

    /// Fold the running interval and stop counting.
    pub fn stop(&mut self, now: Timestamp) {
        self.accumulate(now);
        self.confirmed_storage_since = None;
    }

    pub fn is_running(&self) -> bool {
        self.confirmed_storage_since.is_some()
    }
}

/// Upload shard of one replicator: whose uploads it counts and for how much.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModificationShardInfo {
    /// Current members and their cumulative uploaded bytes.
    pub actual_shard_members: BTreeMap<Key, u64>,
    /// Evicted members; their counters are kept for later settlement.
    pub former_shard_members: BTreeMap<Key, u64>,
    pub owner_upload: u64,
}

impl ModificationShardInfo {
    pub fn contains(&self, key: &Key) -> bool {
        self.actual_shard_members.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.actual_shard_members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actual_shard_members.is_empty()
    }

    /// Add a member with a zero counter; existing members are left untouched.
    pub fn add_member(&mut self, key: Key) {
        self.actual_shard_members.entry(key).or_insert(0);
    }

    /// Move a member to the former set with its counter. An existing former
    /// entry for the same key is left as is.
    pub fn evict_member(&mut self, key: &Key) {
        if let Some(upload) = self.actual_shard_members.remove(key) {
            self.former_shard_members.entry(*key).or_insert(upload);
        }
    }

    /// Drop a member that left the drive; its former entry starts at zero.
    pub fn retire_member(&mut self, key: &Key) {
        if self.actual_shard_members.remove(key).is_some() {
            self.former_shard_members.entry(*key).or_insert(0);
        }
    }
}

/// Running storage verification of a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub verification_trigger: Hash256,
    pub expiration: Timestamp,
    pub duration_ms: u64,
    pub shards: Vec<BTreeSet<Key>>,
}

impl Verification {
    pub fn expired(&self, now: Timestamp) -> bool {
        now >= self.expiration
    }

    /// True once every shard has reported.
    pub fn is_finished(&self) -> bool {
        self.shards.iter().all(BTreeSet::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveEntry {
    pub key: Key,
    pub owner: Key,
    pub root_hash: Hash256,
    /// Ordered capacity in megabytes.
    pub size: u64,
    pub used_size_bytes: u64,
    pub meta_files_size_bytes: u64,
    pub replicator_count: u16,
    pub active_data_modifications: Vec<ActiveDataModification>,
    pub completed_data_modifications: Vec<CompletedDataModification>,
    pub confirmed_used_sizes: BTreeMap<Key, u64>,
    pub replicators: BTreeSet<Key>,
    pub former_replicators: BTreeSet<Key>,
    pub offboarding_replicators: Vec<Key>,
    #[serde(default)]
    pub verification: Option<Verification>,
    pub confirmed_states: BTreeMap<Key, Hash256>,
    pub confirmed_storage_infos: BTreeMap<Key, ConfirmedStorageInfo>,
    pub download_shards: BTreeSet<Hash256>,
    pub data_modification_shards: BTreeMap<Key, ModificationShardInfo>,
    pub payment_link: QueueLink,
    pub last_payment: Timestamp,
    pub verification_node: AvlTreeNode,
}

impl DriveEntry {
    pub fn new(key: Key, owner: Key, size: u64, replicator_count: u16) -> Self {
        Self {
            key,
            owner,
            root_hash: Hash256::ZERO,
            size,
            used_size_bytes: 0,
            meta_files_size_bytes: 0,
            replicator_count,
            active_data_modifications: Vec::new(),
            completed_data_modifications: Vec::new(),
            confirmed_used_sizes: BTreeMap::new(),
            replicators: BTreeSet::new(),
            former_replicators: BTreeSet::new(),
            offboarding_replicators: Vec::new(),
            verification: None,
            confirmed_states: BTreeMap::new(),
            confirmed_storage_infos: BTreeMap::new(),
            download_shards: BTreeSet::new(),
            data_modification_shards: BTreeMap::new(),
            payment_link: QueueLink::default(),
            last_payment: Timestamp::default(),
            verification_node: AvlTreeNode::default(),
        }
    }

    /// Most recently approved modification, if any.
    pub fn last_approved_modification(&self) -> Option<&CompletedDataModification> {
        self.completed_data_modifications
            .iter()
            .rev()
            .find(|modification| modification.is_approved())
    }

    /// No modification has completed yet, so joining replicators hold the whole drive from the start.
    pub fn is_fresh(&self) -> bool {
        self.completed_data_modifications.is_empty()
    }

    /// Number of replicators that still have to be assigned.
    pub fn missing_replicators(&self) -> usize {
        (self.replicator_count as usize).saturating_sub(self.replicators.len())
    }

    /// Replicators staying on the drive, excluding those waiting to leave.
    pub fn staying_replicator_count(&self) -> usize {
        self.replicators
            .iter()
            .filter(|key| !self.offboarding_replicators.contains(key))
            .count()
    }

    pub fn has_running_verification(&self, now: Timestamp) -> bool {
        self.verification
            .as_ref()
            .map(|verification| !verification.expired(now))
            .unwrap_or(false)
    }
}

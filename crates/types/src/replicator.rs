use crate::{Amount, AvlTreeNode, Hash256, Key};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-drive progress of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriveInfo {
    pub last_approved_data_modification_id: Hash256,
    /// Megabytes to download when joining a drive with existing data.
    pub initial_download_work_mb: u64,
    pub last_completed_cumulative_download_work_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorEntry {
    pub key: Key,
    pub capacity: Amount,
    pub drives: BTreeMap<Key, DriveInfo>,
    pub download_channels: BTreeSet<Hash256>,
    pub replicators_set_node: AvlTreeNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_boot_key: Option<Key>,
}

impl ReplicatorEntry {
    pub fn new(key: Key, capacity: Amount) -> Self {
        Self {
            key,
            capacity,
            drives: BTreeMap::new(),
            download_channels: BTreeSet::new(),
            replicators_set_node: AvlTreeNode::default(),
            node_boot_key: None,
        }
    }
}

use crate::Key;
use serde::{Deserialize, Serialize};

/// AVL node fields embedded in an entity; child pointers are entity keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AvlTreeNode {
    pub left: Key,
    pub right: Key,
    pub height: u32,
    pub size: u32,
}

impl AvlTreeNode {
    /// Fields of a node freshly attached as a leaf.
    pub fn leaf() -> Self {
        Self {
            left: Key::ZERO,
            right: Key::ZERO,
            height: 1,
            size: 1,
        }
    }
}

/// Doubly linked list pointers embedded in a queued entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueLink {
    pub previous: Key,
    pub next: Key,
}

/// Head record of a queue or tree; trees keep their root in `first`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: Key,
    pub first: Key,
    pub last: Key,
    pub size: u32,
}

impl QueueEntry {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }
}

/// Fixed keys under which the shared index heads are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WellKnownKey {
    DrivePaymentQueue,
    DownloadChannelPaymentQueue,
    ReplicatorsSetTree,
    DriveVerificationsTree,
    DrivePriorityQueue,
}

impl WellKnownKey {
    pub const ALL: [WellKnownKey; 5] = [
        WellKnownKey::DrivePaymentQueue,
        WellKnownKey::DownloadChannelPaymentQueue,
        WellKnownKey::ReplicatorsSetTree,
        WellKnownKey::DriveVerificationsTree,
        WellKnownKey::DrivePriorityQueue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WellKnownKey::DrivePaymentQueue => "drive-payment-queue",
            WellKnownKey::DownloadChannelPaymentQueue => "download-channel-payment-queue",
            WellKnownKey::ReplicatorsSetTree => "replicators-set-tree",
            WellKnownKey::DriveVerificationsTree => "drive-verifications-tree",
            WellKnownKey::DrivePriorityQueue => "drive-priority-queue",
        }
    }

    pub fn key(self) -> Key {
        Key::digest(self.name().as_bytes())
    }
}

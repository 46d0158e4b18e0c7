//! Validated inputs consumed by the storage observers.

use crate::error::{ObserverError, Result};
use drivenet_types::{Amount, Hash256, Key};
use serde::{Deserialize, Serialize};

/// Bit `index` of an LSB-first bitset.
pub fn is_bit_set(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .map(|byte| (byte >> (index % 8)) & 1 == 1)
        .unwrap_or(false)
}

/// Pack booleans into an LSB-first bitset.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (index, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[index / 8] |= 1 << (index % 8);
        }
    }
    bytes
}

/// Opinions of judging keys about judged keys.
///
/// `public_keys` lists judging-only keys, then overlapping keys (both judging
/// and judged), then judged-only keys. `present_opinions` is a row-major
/// bitset over judging × judged; `opinions` holds the values of the set bits
/// in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpinionMatrix {
    pub public_keys: Vec<Key>,
    pub judging_keys_count: u8,
    pub overlapping_keys_count: u8,
    pub judged_keys_count: u8,
    pub present_opinions: Vec<u8>,
    pub opinions: Vec<u64>,
}

impl OpinionMatrix {
    pub fn total_judging(&self) -> usize {
        self.judging_keys_count as usize + self.overlapping_keys_count as usize
    }

    pub fn total_judged(&self) -> usize {
        self.overlapping_keys_count as usize + self.judged_keys_count as usize
    }

    pub fn judging_keys(&self) -> &[Key] {
        let end = self.total_judging().min(self.public_keys.len());
        &self.public_keys[..end]
    }

    pub fn judged_keys(&self) -> &[Key] {
        let start = (self.judging_keys_count as usize).min(self.public_keys.len());
        let end = (start + self.total_judged()).min(self.public_keys.len());
        &self.public_keys[start..end]
    }

    /// Expand into `rows[judging][judged]`, checking the declared shape.
    pub fn rows(&self) -> Result<Vec<Vec<Option<u64>>>> {
        let judging = self.total_judging();
        let judged = self.total_judged();
        if self.public_keys.len() != judging + self.judged_keys_count as usize {
            return Err(ObserverError::MalformedOpinions(format!(
                "expected {} public keys, got {}",
                judging + self.judged_keys_count as usize,
                self.public_keys.len()
            )));
        }

        let mut values = self.opinions.iter();
        let mut rows = Vec::with_capacity(judging);
        for row in 0..judging {
            let mut cells = Vec::with_capacity(judged);
            for column in 0..judged {
                if is_bit_set(&self.present_opinions, row * judged + column) {
                    let value = values.next().ok_or_else(|| {
                        ObserverError::MalformedOpinions("fewer opinions than present bits".into())
                    })?;
                    cells.push(Some(*value));
                } else {
                    cells.push(None);
                }
            }
            rows.push(cells);
        }
        if values.next().is_some() {
            return Err(ObserverError::MalformedOpinions(
                "more opinions than present bits".into(),
            ));
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareDriveNotification {
    pub owner: Key,
    pub drive_key: Key,
    pub drive_size: u64,
    pub replicator_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveClosureNotification {
    pub drive_key: Key,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadNotification {
    pub id: Hash256,
    pub drive_key: Key,
    pub consumer: Key,
    pub download_size: u64,
    pub feedback_fee_amount: Amount,
    #[serde(default)]
    pub whitelisted_public_keys: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPaymentNotification {
    pub download_channel_id: Hash256,
    pub download_size: u64,
    pub feedback_fee_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishDownloadNotification {
    pub download_channel_id: Hash256,
    pub feedback_fee_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadApprovalNotification {
    pub download_channel_id: Hash256,
    pub approval_trigger: Hash256,
    /// Cumulative payments each judging replicator attributes to each judged one.
    pub opinions: OpinionMatrix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChannelRefundNotification {
    pub download_channel_id: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataModificationNotification {
    pub data_modification_id: Hash256,
    pub drive_key: Key,
    pub owner: Key,
    pub download_data_cdi: Hash256,
    pub upload_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataModificationApprovalNotification {
    pub drive_key: Key,
    pub data_modification_id: Hash256,
    pub file_structure_cdi: Hash256,
    pub file_structure_size: u64,
    pub meta_files_size: u64,
    pub used_drive_size: u64,
    /// Cumulative upload sizes (bytes) reported by the approving replicators.
    pub opinions: OpinionMatrix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataModificationSingleApprovalNotification {
    pub drive_key: Key,
    pub public_key: Key,
    pub data_modification_id: Hash256,
    pub used_drive_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataModificationCancelNotification {
    pub drive_key: Key,
    pub owner: Key,
    pub data_modification_id: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorOnboardingNotification {
    pub public_key: Key,
    pub capacity: Amount,
    #[serde(default)]
    pub node_boot_key: Option<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorOffboardingNotification {
    pub public_key: Key,
    pub drive_key: Key,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorsCleanupNotification {
    pub replicator_keys: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStartNotification {
    pub stream_id: Hash256,
    pub drive_key: Key,
    pub owner: Key,
    pub expected_upload_size: u64,
    #[serde(default)]
    pub folder_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPaymentNotification {
    pub drive_key: Key,
    pub stream_id: Hash256,
    pub additional_upload_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFinishNotification {
    pub drive_key: Key,
    pub stream_id: Hash256,
    pub actual_upload_size: u64,
    pub stream_structure_cdi: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndDriveVerificationNotification {
    pub drive_key: Key,
    pub verification_trigger: Hash256,
    pub shard_id: u16,
    /// Provers of the shard that published opinions.
    pub judging_keys: Vec<Key>,
    /// Row-major bitset judging × shard members (sorted), set when the prover passed.
    pub opinions: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardsUpdateNotification {
    pub drive_key: Key,
}

/// Every notification the storage observers react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageNotification {
    PrepareDrive(PrepareDriveNotification),
    DriveClosure(DriveClosureNotification),
    Download(DownloadNotification),
    DownloadPayment(DownloadPaymentNotification),
    FinishDownload(FinishDownloadNotification),
    DownloadApproval(DownloadApprovalNotification),
    DownloadChannelRefund(DownloadChannelRefundNotification),
    DataModification(DataModificationNotification),
    DataModificationApproval(DataModificationApprovalNotification),
    DataModificationSingleApproval(DataModificationSingleApprovalNotification),
    DataModificationCancel(DataModificationCancelNotification),
    ReplicatorOnboarding(ReplicatorOnboardingNotification),
    ReplicatorOffboarding(ReplicatorOffboardingNotification),
    ReplicatorsCleanup(ReplicatorsCleanupNotification),
    StreamStart(StreamStartNotification),
    StreamPayment(StreamPaymentNotification),
    StreamFinish(StreamFinishNotification),
    EndDriveVerification(EndDriveVerificationNotification),
    ShardsUpdate(ShardsUpdateNotification),
    /// End-of-block tick: verification start, storage and download billing.
    Block,
}

impl StorageNotification {
    pub fn name(&self) -> &'static str {
        match self {
            StorageNotification::PrepareDrive(_) => "PrepareDrive",
            StorageNotification::DriveClosure(_) => "DriveClosure",
            StorageNotification::Download(_) => "Download",
            StorageNotification::DownloadPayment(_) => "DownloadPayment",
            StorageNotification::FinishDownload(_) => "FinishDownload",
            StorageNotification::DownloadApproval(_) => "DownloadApproval",
            StorageNotification::DownloadChannelRefund(_) => "DownloadChannelRefund",
            StorageNotification::DataModification(_) => "DataModification",
            StorageNotification::DataModificationApproval(_) => "DataModificationApproval",
            StorageNotification::DataModificationSingleApproval(_) => {
                "DataModificationSingleApproval"
            }
            StorageNotification::DataModificationCancel(_) => "DataModificationCancel",
            StorageNotification::ReplicatorOnboarding(_) => "ReplicatorOnboarding",
            StorageNotification::ReplicatorOffboarding(_) => "ReplicatorOffboarding",
            StorageNotification::ReplicatorsCleanup(_) => "ReplicatorsCleanup",
            StorageNotification::StreamStart(_) => "StreamStart",
            StorageNotification::StreamPayment(_) => "StreamPayment",
            StorageNotification::StreamFinish(_) => "StreamFinish",
            StorageNotification::EndDriveVerification(_) => "EndDriveVerification",
            StorageNotification::ShardsUpdate(_) => "ShardsUpdate",
            StorageNotification::Block => "Block",
        }
    }
}

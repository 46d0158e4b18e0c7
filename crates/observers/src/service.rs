//! Snapshots and events handed to the replicator-local storage service.

use crate::error::{ObserverError, Result};
use drivenet_storage::{EntityStore, MemoryStore, StorageState};
use drivenet_types::{
    ActiveDataModification, DataModificationApprovalState, DownloadChannelEntry, DriveEntry,
    Hash256, Key, ModificationShardInfo, ReplicatorEntry, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Replicator progress on a drive as seen by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorDriveSnapshot {
    pub last_approved_data_modification_id: Hash256,
    pub initial_download_work_mb: u64,
    pub last_completed_cumulative_download_work_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChannelSnapshot {
    pub id: Hash256,
    pub drive: Key,
    pub download_size_mb: u64,
    /// Whitelisted keys followed by the consumer.
    pub consumers: Vec<Key>,
    pub replicators: Vec<Key>,
    pub approval_initiation_event: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovedModificationSnapshot {
    pub modification: ActiveDataModification,
    /// Replicators whose confirmed state is this modification.
    pub signers: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveVerificationSnapshot {
    pub drive: Key,
    pub duration_ms: u64,
    pub expired: bool,
    pub verification_trigger: Hash256,
    pub last_modification_id: Hash256,
    pub shards: Vec<BTreeSet<Key>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveSnapshot {
    pub id: Key,
    pub owner: Key,
    pub root_hash: Hash256,
    pub size: u64,
    pub replicators: BTreeMap<Key, ReplicatorDriveSnapshot>,
    pub modification_shards: BTreeMap<Key, ModificationShardInfo>,
    /// Members of the local replicator's own shard.
    pub donator_shard: Vec<Key>,
    /// Replicators whose shard contains the local replicator.
    pub recipient_shard: Vec<Key>,
    pub download_channels: BTreeMap<Hash256, DownloadChannelSnapshot>,
    pub data_modifications: Vec<ActiveDataModification>,
    pub completed_modifications: Vec<(Hash256, DataModificationApprovalState)>,
    pub download_work_bytes: u64,
    pub last_approved_modification: Option<ApprovedModificationSnapshot>,
    pub verification: Option<DriveVerificationSnapshot>,
}

/// Events for the storage service running next to the local replicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceNotification {
    DriveAdded(DriveSnapshot),
    DrivesUpdated { drives: Vec<DriveSnapshot> },
    DriveClosed { drive: Key },
    DownloadChannelOpened(DownloadChannelSnapshot),
    DownloadApprovalInitiated { channel: Hash256, event: Hash256 },
    DownloadFinished { channel: Hash256 },
    DataModificationApproved { drive: Key, modification: Hash256 },
    DataModificationCancelled { drive: Key, modification: Hash256 },
    VerificationStarted(DriveVerificationSnapshot),
}

/// Receives service notifications once a block has been applied.
pub trait ServiceNotificationSink {
    fn publish(&self, notification: &ServiceNotification);
}

/// Observes drives leaving the network.
pub trait StorageUpdatesListener {
    fn on_drive_closed(&self, drive: &DriveEntry);
}

/// Id of the last completed modification, or zero.
pub fn last_modification_id(drive: &DriveEntry) -> Hash256 {
    drive
        .completed_data_modifications
        .last()
        .map(|completed| completed.modification.id)
        .unwrap_or(Hash256::ZERO)
}

pub fn drive_verification_snapshot(
    drive: &DriveEntry,
    now: Timestamp,
) -> Result<DriveVerificationSnapshot> {
    let verification = drive
        .verification
        .as_ref()
        .ok_or(ObserverError::NoVerification(drive.key))?;
    Ok(DriveVerificationSnapshot {
        drive: drive.key,
        duration_ms: verification.duration_ms,
        expired: verification.expired(now),
        verification_trigger: verification.verification_trigger,
        last_modification_id: last_modification_id(drive),
        shards: verification.shards.clone(),
    })
}

/// Channel snapshot, or `None` when `local` does not serve it.
pub fn download_channel_snapshot(
    local: &Key,
    channel: &DownloadChannelEntry,
) -> Option<DownloadChannelSnapshot> {
    if !channel.shard_replicators.contains(local) {
        return None;
    }
    let mut consumers = channel.list_of_public_keys.clone();
    consumers.push(channel.consumer);
    Some(DownloadChannelSnapshot {
        id: channel.id,
        drive: channel.drive,
        download_size_mb: channel.download_size_mb,
        consumers,
        replicators: channel.shard_replicators.iter().copied().collect(),
        approval_initiation_event: channel.download_approval_initiation_event,
    })
}

/// Full view of `drive_key` from the perspective of `local`.
pub fn drive_snapshot(
    state: &StorageState,
    drive_key: &Key,
    local: &Key,
    now: Timestamp,
) -> Result<DriveSnapshot> {
    let drive = state
        .drives
        .find(drive_key)
        .ok_or(ObserverError::DriveNotFound(*drive_key))?;
    drive_snapshot_of(drive, &state.replicators, &state.download_channels, local, now)
}

pub fn drive_snapshot_of(
    drive: &DriveEntry,
    replicators: &MemoryStore<Key, ReplicatorEntry>,
    channels: &MemoryStore<Hash256, DownloadChannelEntry>,
    local: &Key,
    now: Timestamp,
) -> Result<DriveSnapshot> {
    let mut replicator_infos = BTreeMap::new();
    for key in &drive.replicators {
        let replicator = replicators
            .find(key)
            .ok_or(ObserverError::ReplicatorNotFound(*key))?;
        let info = replicator
            .drives
            .get(&drive.key)
            .ok_or(ObserverError::DriveInfoNotFound {
                replicator: *key,
                drive: drive.key,
            })?;
        replicator_infos.insert(
            *key,
            ReplicatorDriveSnapshot {
                last_approved_data_modification_id: info.last_approved_data_modification_id,
                initial_download_work_mb: info.initial_download_work_mb,
                last_completed_cumulative_download_work_bytes: info
                    .last_completed_cumulative_download_work_bytes,
            },
        );
    }

    let donator_shard = drive
        .data_modification_shards
        .get(local)
        .map(|shard| shard.actual_shard_members.keys().copied().collect())
        .unwrap_or_default();
    let recipient_shard = drive
        .data_modification_shards
        .iter()
        .filter(|(_, shard)| shard.contains(local))
        .map(|(key, _)| *key)
        .collect();

    let mut download_channels = BTreeMap::new();
    for id in &drive.download_shards {
        let channel = channels
            .find(id)
            .ok_or(ObserverError::DownloadChannelNotFound(*id))?;
        if let Some(snapshot) = download_channel_snapshot(local, channel) {
            download_channels.insert(*id, snapshot);
        }
    }

    let last_approved_modification =
        drive
            .last_approved_modification()
            .map(|approved| ApprovedModificationSnapshot {
                modification: approved.modification.clone(),
                signers: drive
                    .confirmed_states
                    .iter()
                    .filter(|(_, state)| **state == approved.modification.id)
                    .map(|(key, _)| *key)
                    .collect(),
            });

    let verification = match drive.verification {
        Some(_) => Some(drive_verification_snapshot(drive, now)?),
        None => None,
    };

    Ok(DriveSnapshot {
        id: drive.key,
        owner: drive.owner,
        root_hash: drive.root_hash,
        size: drive.size,
        download_work_bytes: replicator_infos
            .get(local)
            .map(|info: &ReplicatorDriveSnapshot| info.last_completed_cumulative_download_work_bytes)
            .unwrap_or(0),
        replicators: replicator_infos,
        modification_shards: drive.data_modification_shards.clone(),
        donator_shard,
        recipient_shard,
        download_channels,
        data_modifications: drive.active_data_modifications.clone(),
        completed_modifications: drive
            .completed_data_modifications
            .iter()
            .map(|completed| (completed.modification.id, completed.state))
            .collect(),
        last_approved_modification,
        verification,
    })
}

//! Data modifications: requests, approvals and cancellations.
//!
//! The owner prepays `2 * size * replicators` streaming units when a
//! modification is queued; the amount is kept on the modification so refunds
//! return exactly what was locked. Approval pays replicators for the data they had to
//! download and upload and returns the unused part to the owner.

use crate::closure::pending_modification_work;
use crate::context::ObserverContext;
use crate::error::{ObserverError, Result};
use crate::notifications::{
    DataModificationApprovalNotification, DataModificationCancelNotification,
    DataModificationNotification, DataModificationSingleApprovalNotification,
};
use crate::service::ServiceNotification;
use drivenet_storage::{EntityStore, StorageState};
use drivenet_types::{
    megabytes_from_bytes, ActiveDataModification, Amount, CompletedDataModification,
    ConfirmedStorageInfo, DataModificationApprovalState, DriveEntry, DriveInfo, Hash256, Key,
    StorageReceiptKind, Timestamp, BYTES_PER_MEGABYTE,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Streaming units the owner locks for `upload_size_mb` on `replicator_count` replicators.
pub fn modification_prepayment(upload_size_mb: u64, replicator_count: usize) -> u64 {
    upload_size_mb
        .saturating_mul(2)
        .saturating_mul(replicator_count as u64)
}

/// Share of the prepayment covering the megabytes that were never uploaded.
pub fn unused_prepayment(modification: &ActiveDataModification) -> u64 {
    let expected = modification.expected_upload_size_mb;
    if expected == 0 {
        return modification.prepaid_streaming_units;
    }
    let unused = expected.saturating_sub(modification.actual_upload_size_mb);
    (u128::from(modification.prepaid_streaming_units) * u128::from(unused) / u128::from(expected)) as u64
}

/// Megabytes approved since `last_approved`, newest first, skipping cancelled ones.
pub fn download_work_mb(drive: &DriveEntry, last_approved: &Hash256) -> u64 {
    drive
        .completed_data_modifications
        .iter()
        .rev()
        .take_while(|completed| completed.modification.id != *last_approved)
        .filter(|completed| completed.is_approved())
        .map(|completed| completed.modification.actual_upload_size_mb)
        .sum()
}

/// Pay out `amount` of the drive's streaming units, capped by what it holds.
pub(crate) fn pay_from_drive(
    ctx: &mut ObserverContext<'_>,
    kind: StorageReceiptKind,
    drive_key: &Key,
    recipient: &Key,
    amount: u64,
) -> Result<()> {
    let streaming = ctx.streaming_mosaic();
    let available = ctx.balance(drive_key, streaming).get();
    ctx.pay_out(kind, drive_key, recipient, streaming, Amount(amount.min(available)))
}

fn start_confirmed_storage(drive: &mut DriveEntry, replicator: &Key, now: Timestamp) {
    let info = drive.confirmed_storage_infos.entry(*replicator).or_default();
    if !info.is_running() {
        *info = ConfirmedStorageInfo {
            time_in_confirmed_storage: info.time_in_confirmed_storage,
            confirmed_storage_since: Some(now),
        };
    }
}

/// Bring a replicator's drive info up to the latest approval; returns the megabytes it downloaded.
fn settle_download_work(drive: &DriveEntry, info: &mut DriveInfo) -> u64 {
    let modifications = download_work_mb(drive, &info.last_approved_data_modification_id);
    let work = modifications.saturating_add(info.initial_download_work_mb);
    if let Some(last) = drive.last_approved_modification() {
        info.last_approved_data_modification_id = last.modification.id;
    }
    info.initial_download_work_mb = 0;
    info.last_completed_cumulative_download_work_bytes = info
        .last_completed_cumulative_download_work_bytes
        .saturating_add(modifications.saturating_mul(BYTES_PER_MEGABYTE));
    work
}

fn local_serves(ctx: &ObserverContext<'_>, drive_key: &Key) -> bool {
    match (ctx.local_replicator, ctx.state.drives.find(drive_key)) {
        (Some(local), Some(drive)) => drive.replicators.contains(&local),
        _ => false,
    }
}

/// Queue a modification and collect the owner's prepayment.
pub fn request_data_modification(
    ctx: &mut ObserverContext<'_>,
    notification: &DataModificationNotification,
) -> Result<()> {
    let drive_key = notification.drive_key;
    let prepayment = {
        let drive = ctx
            .state
            .drives
            .find_mut(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;
        let mut modification = ActiveDataModification::new(
            notification.data_modification_id,
            notification.owner,
            notification.download_data_cdi,
            notification.upload_size,
        );
        modification.prepaid_streaming_units =
            modification_prepayment(notification.upload_size, drive.replicators.len());
        let prepayment = modification.prepaid_streaming_units;
        drive.active_data_modifications.push(modification);
        prepayment
    };

    let streaming = ctx.streaming_mosaic();
    ctx.pay_in(
        StorageReceiptKind::DataModificationPayment,
        &notification.owner,
        &drive_key,
        streaming,
        Amount(prepayment),
    )?;
    debug!(drive = %drive_key, modification = %notification.data_modification_id, size = notification.upload_size, "Data modification queued");
    Ok(())
}

/// Error for a modification that is not at the head of the queue.
fn not_first(drive: &DriveEntry, id: &Hash256) -> ObserverError {
    if drive.active_data_modifications.iter().any(|active| active.id == *id) {
        ObserverError::ModificationNotFirst { drive: drive.key, id: *id }
    } else {
        ObserverError::ModificationNotFound { drive: drive.key, id: *id }
    }
}

/// Upload increments per uploader, read from the opinions of approving judges.
///
/// Each judge's shard records how much it has already credited every uploader;
/// only the megabyte increment over that counter is paid.
fn collect_upload_work(
    drive: &mut DriveEntry,
    notification: &DataModificationApprovalNotification,
    approvers: &BTreeSet<Key>,
) -> Result<Vec<(Key, u64)>> {
    let rows = notification.opinions.rows()?;
    let judging = notification.opinions.judging_keys();
    let judged = notification.opinions.judged_keys();
    let owner = drive.owner;
    let mut increments: Vec<(Key, u64)> = Vec::new();

    for (row, judge) in rows.iter().zip(judging) {
        if !approvers.contains(judge) {
            continue;
        }
        let Some(shard) = drive.data_modification_shards.get_mut(judge) else {
            continue;
        };
        for (cell, uploader) in row.iter().zip(judged) {
            let Some(uploaded) = *cell else {
                continue;
            };
            let recorded = if *uploader == owner {
                &mut shard.owner_upload
            } else if let Some(counter) = shard.actual_shard_members.get_mut(uploader) {
                counter
            } else if let Some(counter) = shard.former_shard_members.get_mut(uploader) {
                counter
            } else {
                continue;
            };
            if uploaded <= *recorded {
                continue;
            }
            let increment = megabytes_from_bytes(uploaded) - megabytes_from_bytes(*recorded);
            *recorded = uploaded;
            if *uploader != owner && increment > 0 {
                increments.push((*uploader, increment));
            }
        }
    }
    Ok(increments)
}

/// Approve the head modification of a drive.
pub fn approve_data_modification(
    ctx: &mut ObserverContext<'_>,
    notification: &DataModificationApprovalNotification,
) -> Result<()> {
    let drive_key = notification.drive_key;
    let id = notification.data_modification_id;
    let now = ctx.timestamp;

    let (download_work, upload_work, refund, owner) = {
        let StorageState {
            drives, replicators, ..
        } = &mut *ctx.state;
        let drive = drives
            .find_mut(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;

        match drive.active_data_modifications.first() {
            Some(head) if head.id == id => {
                if !head.ready_for_approval {
                    return Err(ObserverError::ModificationNotReady { drive: drive_key, id });
                }
            }
            _ => return Err(not_first(drive, &id)),
        }
        let modification = drive.active_data_modifications.remove(0);
        let refund = unused_prepayment(&modification);
        drive.completed_data_modifications.push(CompletedDataModification {
            modification,
            state: DataModificationApprovalState::Approved,
        });
        drive.root_hash = notification.file_structure_cdi;
        drive.used_size_bytes = notification.used_drive_size;
        drive.meta_files_size_bytes = notification.meta_files_size;

        let approvers: BTreeSet<Key> = notification
            .opinions
            .judging_keys()
            .iter()
            .filter(|key| drive.replicators.contains(*key))
            .copied()
            .collect();
        let others: Vec<Key> = drive
            .replicators
            .iter()
            .filter(|key| !approvers.contains(*key))
            .copied()
            .collect();
        for approver in &approvers {
            drive.confirmed_states.insert(*approver, id);
            drive
                .confirmed_used_sizes
                .insert(*approver, notification.used_drive_size);
            start_confirmed_storage(drive, approver, now);
        }
        for other in &others {
            if let Some(info) = drive.confirmed_storage_infos.get_mut(other) {
                info.stop(now);
            }
        }

        let mut download_work = Vec::with_capacity(approvers.len());
        for approver in &approvers {
            let info = replicators
                .find_mut(approver)
                .ok_or(ObserverError::ReplicatorNotFound(*approver))?
                .drives
                .get_mut(&drive_key)
                .ok_or(ObserverError::DriveInfoNotFound {
                    replicator: *approver,
                    drive: drive_key,
                })?;
            download_work.push((*approver, settle_download_work(drive, info)));
        }

        let upload_work = collect_upload_work(drive, notification, &approvers)?;
        (download_work, upload_work, refund, drive.owner)
    };

    for (replicator, work) in &download_work {
        pay_from_drive(ctx, StorageReceiptKind::DownloadWorkPayment, &drive_key, replicator, *work)?;
    }
    for (uploader, work) in &upload_work {
        pay_from_drive(ctx, StorageReceiptKind::UploadWorkPayment, &drive_key, uploader, *work)?;
    }
    pay_from_drive(ctx, StorageReceiptKind::DataModificationRefund, &drive_key, &owner, refund)?;

    if local_serves(ctx, &drive_key) {
        ctx.notify_service(ServiceNotification::DataModificationApproved {
            drive: drive_key,
            modification: id,
        });
    }
    info!(
        drive = %drive_key,
        modification = %id,
        approvers = download_work.len(),
        uploaders = upload_work.len(),
        "Data modification approved"
    );
    Ok(())
}

/// A single replicator catches up with the drive's latest approved state.
pub fn single_approval(
    ctx: &mut ObserverContext<'_>,
    notification: &DataModificationSingleApprovalNotification,
) -> Result<()> {
    let drive_key = notification.drive_key;
    let replicator = notification.public_key;
    let id = notification.data_modification_id;
    let now = ctx.timestamp;

    let work = {
        let StorageState {
            drives, replicators, ..
        } = &mut *ctx.state;
        let drive = drives
            .find_mut(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;
        if !drive.replicators.contains(&replicator) {
            return Err(ObserverError::ReplicatorNotFound(replicator));
        }
        let latest = drive
            .last_approved_modification()
            .map(|approved| approved.modification.id);
        if latest != Some(id) {
            return Err(ObserverError::ModificationNotFound { drive: drive_key, id });
        }

        let info = replicators
            .find_mut(&replicator)
            .ok_or(ObserverError::ReplicatorNotFound(replicator))?
            .drives
            .get_mut(&drive_key)
            .ok_or(ObserverError::DriveInfoNotFound {
                replicator,
                drive: drive_key,
            })?;
        let work = settle_download_work(drive, info);

        drive.confirmed_states.insert(replicator, id);
        drive
            .confirmed_used_sizes
            .insert(replicator, notification.used_drive_size);
        start_confirmed_storage(drive, &replicator, now);
        work
    };

    pay_from_drive(ctx, StorageReceiptKind::DownloadWorkPayment, &drive_key, &replicator, work)?;
    debug!(drive = %drive_key, replicator = %replicator, work, "Single approval settled");
    Ok(())
}

/// Cancel a queued modification.
///
/// Cancelling the head pays replicators for the work they may have started
/// and returns the rest of the prepayment; a modification further back is
/// refunded in full.
pub fn cancel_data_modification(
    ctx: &mut ObserverContext<'_>,
    notification: &DataModificationCancelNotification,
) -> Result<()> {
    let drive_key = notification.drive_key;
    let id = notification.data_modification_id;

    let (replicators, upload, prepaid, was_head) = {
        let drive = ctx
            .state
            .drives
            .find_mut(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;
        let position = drive
            .active_data_modifications
            .iter()
            .position(|active| active.id == id)
            .ok_or(ObserverError::ModificationNotFound { drive: drive_key, id })?;
        let modification = drive.active_data_modifications.remove(position);
        let upload = modification.expected_upload_size_mb;
        let prepaid = modification.prepaid_streaming_units;
        drive.completed_data_modifications.push(CompletedDataModification {
            modification,
            state: DataModificationApprovalState::Cancelled,
        });
        (drive.replicators.clone(), upload, prepaid, position == 0)
    };

    let mut paid = 0u64;
    if was_head {
        let work = pending_modification_work(upload, replicators.len());
        for replicator in &replicators {
            pay_from_drive(ctx, StorageReceiptKind::UploadWorkPayment, &drive_key, replicator, work)?;
            paid = paid.saturating_add(work);
        }
    }
    pay_from_drive(
        ctx,
        StorageReceiptKind::DataModificationRefund,
        &drive_key,
        &notification.owner,
        prepaid.saturating_sub(paid),
    )?;

    if local_serves(ctx, &drive_key) {
        ctx.notify_service(ServiceNotification::DataModificationCancelled {
            drive: drive_key,
            modification: id,
        });
    }
    info!(drive = %drive_key, modification = %id, head = was_head, "Data modification cancelled");
    Ok(())
}

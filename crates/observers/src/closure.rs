//! Drive closure: final settlement, refunds and teardown.

use crate::adapters::{drive_payment_queue, drive_verification_tree, replicator_tree_of};
use crate::assignment::assign_replicators_to_queued_drives;
use crate::context::ObserverContext;
use crate::deposits::refund_deposits_on_closure;
use crate::error::{ObserverError, Result};
use crate::service::ServiceNotification;
use crate::storage_payment::pay_for_storage;
use drivenet_storage::{EntityStore, StorageState};
use drivenet_types::{Amount, Hash256, Key, StorageReceiptKind, WellKnownKey};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureReason {
    /// The owner asked for the drive to be closed.
    Requested,
    /// The drive ran out of storage units to pay for another period.
    Underfunded,
}

/// Work owed to each replicator for the modification in progress.
pub fn pending_modification_work(upload_size_mb: u64, replicator_count: usize) -> u64 {
    if replicator_count == 0 {
        return 0;
    }
    let n = replicator_count as u64;
    upload_size_mb.saturating_add(upload_size_mb.saturating_mul(n - 1) / n)
}

/// Close `drive_key`, returning every balance it holds and freeing its replicators.
pub fn close_drive(ctx: &mut ObserverContext<'_>, drive_key: &Key, reason: ClosureReason) -> Result<()> {
    let (owner, replicators, pending_upload) = {
        let drive = ctx
            .state
            .drives
            .find(drive_key)
            .ok_or(ObserverError::DriveNotFound(*drive_key))?;
        (
            drive.owner,
            drive.replicators.clone(),
            drive
                .active_data_modifications
                .first()
                .map(|modification| modification.expected_upload_size_mb),
        )
    };
    let storage = ctx.storage_mosaic();
    let streaming = ctx.streaming_mosaic();

    // Refunds change storage balances, which order the tree.
    let freed: Vec<Key> = {
        let mut tree = replicator_tree_of(ctx.state, storage);
        replicators
            .iter()
            .filter(|key| tree.remove_key(key))
            .copied()
            .collect()
    };

    if reason == ClosureReason::Requested {
        pay_for_storage(ctx, drive_key)?;
    }

    if let Some(upload) = pending_upload {
        let work = pending_modification_work(upload, replicators.len());
        for replicator in &replicators {
            let available = ctx.balance(drive_key, streaming).get();
            ctx.pay_out(
                StorageReceiptKind::DownloadWorkPayment,
                drive_key,
                replicator,
                streaming,
                Amount(work.min(available)),
            )?;
        }
    }

    refund_deposits_on_closure(ctx, drive_key, &replicators)?;

    for mosaic in [streaming, storage] {
        let remaining = ctx.balance(drive_key, mosaic);
        ctx.pay_out(StorageReceiptKind::OwnerRefund, drive_key, &owner, mosaic, remaining)?;
    }

    drive_payment_queue(ctx.state).remove(drive_key);
    drive_verification_tree(ctx.state).remove(drive_key);
    ctx.state
        .priority_queue(WellKnownKey::DrivePriorityQueue)
        .remove(drive_key);

    let local = ctx.local_replicator;
    let mut finished: Vec<Hash256> = Vec::new();
    let drive = {
        let StorageState {
            drives,
            replicators: replicator_store,
            download_channels,
            ..
        } = &mut *ctx.state;
        let drive = drives
            .remove(drive_key)
            .ok_or(ObserverError::DriveNotFound(*drive_key))?;

        for id in &drive.download_shards {
            let Some(channel) = download_channels.find_mut(id) else {
                continue;
            };
            if !channel.finish_published {
                channel.finish_published = true;
                if local.map_or(false, |local| channel.shard_replicators.contains(&local)) {
                    finished.push(*id);
                }
            }
        }

        for key in drive.replicators.iter().chain(drive.former_replicators.iter()) {
            if let Some(replicator) = replicator_store.find_mut(key) {
                replicator.drives.remove(drive_key);
                for id in &drive.download_shards {
                    replicator.download_channels.remove(id);
                }
            }
        }
        drive
    };

    for channel in finished {
        ctx.notify_service(ServiceNotification::DownloadFinished { channel });
    }
    for listener in ctx.listeners {
        listener.on_drive_closed(&drive);
    }
    if local.map_or(false, |local| drive.replicators.contains(&local)) {
        ctx.notify_service(ServiceNotification::DriveClosed { drive: *drive_key });
    }
    info!(drive = %drive_key, ?reason, replicators = replicators.len(), "Drive closed");

    let mut salt = b"closure".to_vec();
    salt.extend_from_slice(drive_key.as_bytes());
    let mut rng = ctx.rng(&salt);
    let snapshots = assign_replicators_to_queued_drives(ctx, &freed, &mut rng)?;
    if !snapshots.is_empty() {
        debug!(drive = %drive_key, updated = snapshots.len(), "Freed replicators took queued drives");
        ctx.notify_service(ServiceNotification::DrivesUpdated { drives: snapshots });
    }
    Ok(())
}

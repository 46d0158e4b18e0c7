//! Drive preparation and owner-requested closure.

use crate::adapters::{drive_payment_queue, drive_verification_tree};
use crate::assignment::populate_drive_with_replicators;
use crate::closure::{close_drive, ClosureReason};
use crate::context::ObserverContext;
use crate::error::{ObserverError, Result};
use crate::notifications::{DriveClosureNotification, PrepareDriveNotification};
use crate::service::ServiceNotification;
use drivenet_storage::EntityStore;
use drivenet_types::{Amount, DriveEntry, StorageReceiptKind};
use tracing::info;

/// Create a drive, collect one billing period of storage units and assign replicators.
pub fn prepare_drive(ctx: &mut ObserverContext<'_>, notification: &PrepareDriveNotification) -> Result<()> {
    let drive_key = notification.drive_key;
    if ctx.state.drives.contains(&drive_key) {
        return Err(ObserverError::DriveExists(drive_key));
    }
    let mut drive = DriveEntry::new(
        drive_key,
        notification.owner,
        notification.drive_size,
        notification.replicator_count,
    );
    drive.last_payment = ctx.timestamp;
    ctx.state.drives.insert(drive_key, drive);

    let storage = ctx.storage_mosaic();
    let prepayment = notification
        .drive_size
        .saturating_mul(notification.replicator_count as u64);
    ctx.pay_in(
        StorageReceiptKind::DrivePrepayment,
        &notification.owner,
        &drive_key,
        storage,
        Amount(prepayment),
    )?;

    drive_payment_queue(ctx.state).push_back(drive_key);
    drive_verification_tree(ctx.state).insert(drive_key);

    let mut rng = ctx.rng(drive_key.as_bytes());
    populate_drive_with_replicators(ctx, &drive_key, &mut rng)?;

    if let Some(snapshot) = ctx.local_drive_snapshot(&drive_key)? {
        ctx.notify_service(ServiceNotification::DriveAdded(snapshot));
    }
    info!(
        drive = %drive_key,
        owner = %notification.owner,
        size = notification.drive_size,
        replicators = notification.replicator_count,
        "Drive prepared"
    );
    Ok(())
}

pub fn drive_closure(ctx: &mut ObserverContext<'_>, notification: &DriveClosureNotification) -> Result<()> {
    close_drive(ctx, &notification.drive_key, ClosureReason::Requested)
}

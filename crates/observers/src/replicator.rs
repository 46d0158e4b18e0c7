//! Replicator membership: onboarding, voluntary exit, cleanup and reshuffling.

use crate::adapters::replicator_tree_of;
use crate::assignment::{
    assign_replicators_to_queued_drives, offboard_replicators_from_drive,
    populate_drive_with_replicators, requeue_drive,
};
use crate::context::ObserverContext;
use crate::deposits::refund_deposits_on_offboarding;
use crate::error::{ObserverError, Result};
use crate::notifications::{
    ReplicatorOffboardingNotification, ReplicatorOnboardingNotification,
    ReplicatorsCleanupNotification, ShardsUpdateNotification,
};
use crate::service::ServiceNotification;
use crate::sharding::refresh_shards;
use drivenet_storage::{EntityStore, StorageState};
use drivenet_types::{Amount, Key, ReplicatorEntry, StorageReceiptKind};
use std::collections::BTreeSet;
use tracing::{info, warn};

fn publish_local_drives(ctx: &mut ObserverContext<'_>, drive_keys: &BTreeSet<Key>) -> Result<()> {
    let mut drives = Vec::new();
    for drive_key in drive_keys {
        if let Some(snapshot) = ctx.local_drive_snapshot(drive_key)? {
            drives.push(snapshot);
        }
    }
    if !drives.is_empty() {
        ctx.notify_service(ServiceNotification::DrivesUpdated { drives });
    }
    Ok(())
}

/// Register a replicator, buy its service units and offer it the queued drives.
pub fn onboard_replicator(
    ctx: &mut ObserverContext<'_>,
    notification: &ReplicatorOnboardingNotification,
) -> Result<()> {
    let key = notification.public_key;
    if ctx.state.replicators.contains(&key) {
        return Err(ObserverError::ReplicatorExists(key));
    }
    let mut entry = ReplicatorEntry::new(key, notification.capacity);
    if ctx.config.enable_replicator_boot_key_binding {
        entry.node_boot_key = notification.node_boot_key;
    }
    ctx.state.replicators.insert(key, entry);

    let capacity = notification.capacity.get();
    let storage = ctx.storage_mosaic();
    let streaming = ctx.streaming_mosaic();
    ctx.pay_in(StorageReceiptKind::ReplicatorDeposit, &key, &key, storage, Amount(capacity))?;
    ctx.pay_in(
        StorageReceiptKind::ReplicatorDeposit,
        &key,
        &key,
        streaming,
        Amount(capacity.saturating_mul(2)),
    )?;

    let mut rng = ctx.rng(key.as_bytes());
    let snapshots = assign_replicators_to_queued_drives(ctx, &[key], &mut rng)?;
    info!(replicator = %key, capacity, drives = ctx.state.replicators.find(&key).map_or(0, |r| r.drives.len()), "Replicator onboarded");
    if !snapshots.is_empty() {
        ctx.notify_service(ServiceNotification::DrivesUpdated { drives: snapshots });
    }
    Ok(())
}

/// Mark a replicator as leaving a drive; it exits when a verification lets it go.
pub fn request_offboarding(
    ctx: &mut ObserverContext<'_>,
    notification: &ReplicatorOffboardingNotification,
) -> Result<()> {
    let drive_key = notification.drive_key;
    let key = notification.public_key;
    {
        let drive = ctx
            .state
            .drives
            .find_mut(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;
        if !drive.replicators.contains(&key) {
            return Err(ObserverError::ReplicatorNotFound(key));
        }
        if !drive.offboarding_replicators.contains(&key) {
            drive.offboarding_replicators.push(key);
        }
    }
    requeue_drive(ctx, &drive_key)?;
    info!(drive = %drive_key, replicator = %key, "Replicator requested offboarding");
    Ok(())
}

/// Remove replicators from the network, settling every drive they served.
pub fn cleanup_replicators(
    ctx: &mut ObserverContext<'_>,
    notification: &ReplicatorsCleanupNotification,
) -> Result<()> {
    let storage = ctx.storage_mosaic();
    let mut touched = BTreeSet::new();

    for key in &notification.replicator_keys {
        let (drives, channels) = match ctx.state.replicators.find(key) {
            Some(entry) => (
                entry.drives.keys().copied().collect::<Vec<Key>>(),
                entry.download_channels.clone(),
            ),
            None => {
                warn!(replicator = %key, "Cleanup of unknown replicator");
                continue;
            }
        };
        replicator_tree_of(ctx.state, storage).remove_key(key);

        let leaving: BTreeSet<Key> = [*key].into_iter().collect();
        for drive_key in &drives {
            refund_deposits_on_offboarding(ctx, drive_key, &leaving)?;
            let mut rng = ctx.rng(drive_key.as_bytes());
            offboard_replicators_from_drive(ctx, drive_key, &leaving, &mut rng)?;
            populate_drive_with_replicators(ctx, drive_key, &mut rng)?;
            touched.insert(*drive_key);
        }

        let StorageState {
            replicators,
            download_channels,
            ..
        } = &mut *ctx.state;
        for id in &channels {
            if let Some(channel) = download_channels.find_mut(id) {
                channel.shard_replicators.remove(key);
            }
        }
        replicators.remove(key);
        info!(replicator = %key, drives = drives.len(), "Replicator cleaned up");
    }

    publish_local_drives(ctx, &touched)
}

/// Re-sample a drive's shards from its current replicators.
pub fn update_shards(ctx: &mut ObserverContext<'_>, notification: &ShardsUpdateNotification) -> Result<()> {
    let drive_key = notification.drive_key;
    let shard_size = ctx.config.shard_size();
    let mut rng = ctx.rng(drive_key.as_bytes());
    {
        let StorageState {
            drives,
            replicators,
            download_channels,
            ..
        } = &mut *ctx.state;
        let drive = drives
            .find_mut(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;
        refresh_shards(drive, replicators, download_channels, shard_size, &mut rng)?;
    }
    publish_local_drives(ctx, &[drive_key].into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::drive_priority;
    use crate::test_support::{key, Fixture};
    use drivenet_types::{DriveEntry, PriorityPair, WellKnownKey};

    #[test]
    fn onboarding_buys_service_units_and_takes_queued_drive() {
        let mut fixture = Fixture::new();
        let (xpx, so, sm) = (fixture.xpx(), fixture.so(), fixture.sm());
        fixture.credit(&key(1), xpx, 200);
        let drive = DriveEntry::new(key(100), key(200), 30, 4);
        let priority = drive_priority(&drive, 4);
        fixture.state.drives.insert(key(100), drive);
        fixture
            .state
            .priority_queue(WellKnownKey::DrivePriorityQueue)
            .push(PriorityPair { key: key(100), priority });

        let mut ctx = fixture.context();
        onboard_replicator(
            &mut ctx,
            &ReplicatorOnboardingNotification {
                public_key: key(1),
                capacity: Amount(50),
                node_boot_key: Some(key(9)),
            },
        )
        .unwrap();
        drop(ctx);

        assert_eq!(fixture.balance(&key(1), xpx), 50);
        assert_eq!(fixture.balance(&key(1), so), 20);
        assert_eq!(fixture.balance(&key(1), sm), 40);
        assert_eq!(fixture.balance(&key(100), sm), 60);
        let entry = fixture.state.replicators.find(&key(1)).unwrap();
        assert!(entry.drives.contains_key(&key(100)));
        assert_eq!(entry.node_boot_key, None);
        assert_eq!(replicator_tree_of(&mut fixture.state, so).size(), 1);
    }

    #[test]
    fn duplicate_onboarding_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.replicator(1, 0, false);
        let mut ctx = fixture.context();
        let err = onboard_replicator(
            &mut ctx,
            &ReplicatorOnboardingNotification {
                public_key: key(1),
                capacity: Amount(0),
                node_boot_key: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ObserverError::ReplicatorExists(_)));
    }

    #[test]
    fn offboarding_request_lowers_priority() {
        let mut fixture = Fixture::new();
        for n in 1..=4 {
            fixture.replicator(n, 0, false);
        }
        fixture.drive_with(100, 200, 10, &[1, 2, 3, 4]);
        fixture.state.drives.find_mut(&key(100)).unwrap().replicator_count = 5;
        let notification = ReplicatorOffboardingNotification {
            public_key: key(2),
            drive_key: key(100),
        };
        let mut ctx = fixture.context();
        request_offboarding(&mut ctx, &notification).unwrap();
        request_offboarding(&mut ctx, &notification).unwrap();
        drop(ctx);

        let drive = fixture.state.drives.find(&key(100)).unwrap();
        assert_eq!(drive.offboarding_replicators, vec![key(2)]);
        // Three staying replicators out of a minimum of four.
        let queue = fixture.state.priority_queue(WellKnownKey::DrivePriorityQueue);
        assert_eq!(queue.priority_of(&key(100)), Some(1.0));
    }

    #[test]
    fn cleanup_refunds_and_forgets_replicator() {
        let mut fixture = Fixture::new();
        let (xpx, so, sm) = (fixture.xpx(), fixture.so(), fixture.sm());
        for n in 1..=2 {
            fixture.replicator(n, 0, true);
        }
        fixture.drive_with(100, 200, 10, &[1, 2]);
        fixture.credit(&Key::ZERO, so, 20);
        fixture.credit(&key(100), sm, 40);

        let mut ctx = fixture.context();
        cleanup_replicators(
            &mut ctx,
            &ReplicatorsCleanupNotification {
                replicator_keys: vec![key(1), key(77)],
            },
        )
        .unwrap();
        drop(ctx);

        assert!(!fixture.state.replicators.contains(&key(1)));
        assert_eq!(fixture.balance(&key(1), xpx), 30);
        let drive = fixture.state.drives.find(&key(100)).unwrap();
        assert_eq!(drive.replicators, [key(2)].into_iter().collect());
        assert!(drive.former_replicators.contains(&key(1)));
        assert_eq!(replicator_tree_of(&mut fixture.state, so).keys(), vec![key(2)]);
    }
}

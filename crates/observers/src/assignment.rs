//! Matching replicators to drives.

use crate::adapters::{replicator_tree, replicator_tree_of};
use crate::context::ObserverContext;
use crate::error::{ObserverError, Result};
use crate::priority::{drive_priority, update_drive_priority};
use crate::rng::{next_index, StorageRng};
use crate::service::DriveSnapshot;
use crate::sharding::{refresh_shards, update_shards_on_added_replicator};
use drivenet_storage::{AccountLedger, EntityStore, StorageState};
use drivenet_types::{
    megabytes_from_bytes, Amount, ConfirmedStorageInfo, DriveInfo, Hash256, Key,
    PriorityPair, PriorityQueueEntry, StorageReceiptKind, WellKnownKey,
};
use std::collections::{BTreeSet, BinaryHeap};
use tracing::{debug, info};

/// Add `replicator_key` to a drive: drive info, confirmed storage, shards and deposits.
fn attach_replicator(
    ctx: &mut ObserverContext<'_>,
    drive_key: &Key,
    replicator_key: &Key,
    start_confirmed: bool,
    rng: &mut StorageRng,
) -> Result<()> {
    let shard_size = ctx.config.shard_size();
    let now = ctx.timestamp;
    let StorageState {
        drives,
        replicators,
        download_channels,
        ..
    } = &mut *ctx.state;

    let drive = drives
        .find_mut(drive_key)
        .ok_or(ObserverError::DriveNotFound(*drive_key))?;
    let initial_work = drive
        .used_size_bytes
        .saturating_sub(drive.meta_files_size_bytes);
    let info = DriveInfo {
        last_approved_data_modification_id: drive
            .last_approved_modification()
            .map(|approved| approved.modification.id)
            .unwrap_or(Hash256::ZERO),
        initial_download_work_mb: megabytes_from_bytes(initial_work),
        last_completed_cumulative_download_work_bytes: initial_work,
    };
    replicators
        .find_mut(replicator_key)
        .ok_or(ObserverError::ReplicatorNotFound(*replicator_key))?
        .drives
        .insert(*drive_key, info);

    drive.replicators.insert(*replicator_key);
    let confirmed = if start_confirmed {
        ConfirmedStorageInfo::started_at(now)
    } else {
        ConfirmedStorageInfo::default()
    };
    drive
        .confirmed_storage_infos
        .entry(*replicator_key)
        .or_insert(confirmed);

    update_shards_on_added_replicator(
        drive,
        replicator_key,
        replicators,
        download_channels,
        shard_size,
        rng,
    )?;

    let size = drive.size;
    let storage = ctx.storage_mosaic();
    let streaming = ctx.streaming_mosaic();
    ctx.transfer(
        StorageReceiptKind::DriveDeposit,
        replicator_key,
        &Key::ZERO,
        storage,
        Amount(size),
    )?;
    ctx.transfer(
        StorageReceiptKind::DriveDeposit,
        replicator_key,
        drive_key,
        streaming,
        Amount(size.saturating_mul(2)),
    )?;
    debug!(drive = %drive_key, replicator = %replicator_key, size, "Replicator joined drive");
    Ok(())
}

/// Put the drive in the priority queue while it is short, drop it otherwise.
pub fn requeue_drive(ctx: &mut ObserverContext<'_>, drive_key: &Key) -> Result<()> {
    let min_replicator_count = ctx.config.min_replicator_count;
    let queue_key = WellKnownKey::DrivePriorityQueue.key();
    let StorageState {
        drives,
        priority_queues,
        ..
    } = &mut *ctx.state;
    let drive = drives
        .find(drive_key)
        .ok_or(ObserverError::DriveNotFound(*drive_key))?;
    let queue = priority_queues.get_or_insert_with(queue_key, || PriorityQueueEntry::new(queue_key));
    update_drive_priority(queue, drive, min_replicator_count);
    Ok(())
}

/// Fill a drive's vacancies with random replicators from the replicator-set tree.
///
/// Current and former replicators and the owner are taken out of the tree for
/// the draw; eligible candidates hold at least `size` storage units and
/// `2 * size` streaming units. Every key taken out goes back in.
pub fn populate_drive_with_replicators(
    ctx: &mut ObserverContext<'_>,
    drive_key: &Key,
    rng: &mut StorageRng,
) -> Result<()> {
    let (size, required, excluded, start_confirmed) = {
        let drive = ctx
            .state
            .drives
            .find(drive_key)
            .ok_or(ObserverError::DriveNotFound(*drive_key))?;
        let mut excluded: Vec<Key> = drive
            .replicators
            .iter()
            .chain(drive.former_replicators.iter())
            .copied()
            .collect();
        excluded.push(drive.owner);
        (
            drive.size,
            drive.missing_replicators(),
            excluded,
            drive.is_fresh(),
        )
    };
    if required == 0 {
        return Ok(());
    }

    let storage = ctx.storage_mosaic();
    let streaming = ctx.streaming_mosaic();
    let streaming_needed = Amount(size.saturating_mul(2));
    let (removed, picked, skipped) = {
        let StorageState {
            replicators,
            queues,
            accounts,
            ..
        } = &mut *ctx.state;
        let accounts = &*accounts;
        let mut tree = replicator_tree(replicators, queues, accounts, storage);
        let removed: Vec<Key> = excluded
            .into_iter()
            .filter(|key| tree.remove_key(key))
            .collect();

        // Candidates short of streaming units are set aside and the draw repeats.
        let not_suitable = tree.number_of_less(&(Amount(size), Key::ZERO));
        let mut suitable = tree.size() - not_suitable;
        let mut picked = Vec::with_capacity(required.min(suitable as usize));
        let mut skipped = Vec::new();
        while picked.len() < required && suitable > 0 {
            let index = next_index(rng, suitable as usize) as u32;
            suitable -= 1;
            let Some(key) = tree.extract(not_suitable + index) else {
                continue;
            };
            if accounts.balance(&key, streaming) >= streaming_needed {
                picked.push(key);
            } else {
                skipped.push(key);
            }
        }
        (removed, picked, skipped)
    };
    if !skipped.is_empty() {
        debug!(drive = %drive_key, skipped = skipped.len(), "Skipped replicators short of streaming units");
    }

    for key in &picked {
        attach_replicator(ctx, drive_key, key, start_confirmed, rng)?;
    }

    {
        let mut tree = replicator_tree_of(ctx.state, storage);
        for key in removed.iter().chain(picked.iter()).chain(skipped.iter()) {
            tree.insert(*key);
        }
    }

    requeue_drive(ctx, drive_key)?;
    info!(
        drive = %drive_key,
        assigned = picked.len(),
        missing = required - picked.len(),
        "Populated drive with replicators"
    );
    Ok(())
}

/// Offer queued drives to replicators that are not in the replicator-set tree.
///
/// Each replicator drains the priority queue once, taking every drive that
/// fits its remaining storage and streaming units; the replicators join the tree afterwards.
/// Returns snapshots of updated drives served by the local replicator.
pub fn assign_replicators_to_queued_drives(
    ctx: &mut ObserverContext<'_>,
    replicator_keys: &[Key],
    rng: &mut StorageRng,
) -> Result<Vec<DriveSnapshot>> {
    let storage = ctx.storage_mosaic();
    let streaming = ctx.streaming_mosaic();
    let min_replicator_count = ctx.config.min_replicator_count;
    let local = ctx.local_replicator;
    let mut touched = BTreeSet::new();

    for replicator_key in replicator_keys {
        if !ctx.state.replicators.contains(replicator_key) {
            return Err(ObserverError::ReplicatorNotFound(*replicator_key));
        }
        let mut remaining = ctx.balance(replicator_key, storage).get();
        let mut remaining_streaming = ctx.balance(replicator_key, streaming).get();
        let mut pending = std::mem::take(
            &mut ctx
                .state
                .priority_queue(WellKnownKey::DrivePriorityQueue)
                .heap,
        );
        let mut requeued = BinaryHeap::with_capacity(pending.len());

        while let Some(pair) = pending.pop() {
            let (size, eligible, start_confirmed) = {
                let drive = ctx
                    .state
                    .drives
                    .find(&pair.key)
                    .ok_or(ObserverError::DriveNotFound(pair.key))?;
                let eligible = drive.size <= remaining
                    && drive.size.saturating_mul(2) <= remaining_streaming
                    && !drive.replicators.contains(replicator_key)
                    && !drive.former_replicators.contains(replicator_key)
                    && drive.owner != *replicator_key;
                (drive.size, eligible, drive.is_fresh())
            };
            if !eligible {
                requeued.push(pair);
                continue;
            }

            attach_replicator(ctx, &pair.key, replicator_key, start_confirmed, rng)?;
            remaining -= size;
            remaining_streaming -= size.saturating_mul(2);

            let drive = ctx
                .state
                .drives
                .find(&pair.key)
                .ok_or(ObserverError::DriveNotFound(pair.key))?;
            if drive.missing_replicators() > 0 {
                requeued.push(PriorityPair {
                    key: pair.key,
                    priority: drive_priority(drive, min_replicator_count),
                });
            }
            if local.map_or(false, |local| drive.replicators.contains(&local)) {
                touched.insert(pair.key);
            }
        }

        ctx.state.priority_queue(WellKnownKey::DrivePriorityQueue).heap = requeued;
    }

    {
        let mut tree = replicator_tree_of(ctx.state, storage);
        for key in replicator_keys {
            tree.insert(*key);
        }
    }

    let mut snapshots = Vec::with_capacity(touched.len());
    for drive_key in &touched {
        if let Some(snapshot) = ctx.local_drive_snapshot(drive_key)? {
            snapshots.push(snapshot);
        }
    }
    Ok(snapshots)
}

/// Detach `leaving` from a drive and rebuild its shards.
pub fn offboard_replicators_from_drive(
    ctx: &mut ObserverContext<'_>,
    drive_key: &Key,
    leaving: &BTreeSet<Key>,
    rng: &mut StorageRng,
) -> Result<()> {
    if leaving.is_empty() {
        return Ok(());
    }
    let shard_size = ctx.config.shard_size();
    let StorageState {
        drives,
        replicators,
        download_channels,
        ..
    } = &mut *ctx.state;
    let drive = drives
        .find_mut(drive_key)
        .ok_or(ObserverError::DriveNotFound(*drive_key))?;

    for key in leaving {
        drive.replicators.remove(key);
        drive.former_replicators.insert(*key);
        drive.data_modification_shards.remove(key);
        drive.confirmed_used_sizes.remove(key);
        drive.confirmed_states.remove(key);
        drive.confirmed_storage_infos.remove(key);

        let replicator = replicators
            .find_mut(key)
            .ok_or(ObserverError::ReplicatorNotFound(*key))?;
        replicator.drives.remove(drive_key);
        for id in &drive.download_shards {
            replicator.download_channels.remove(id);
        }
    }
    drive
        .offboarding_replicators
        .retain(|key| !leaving.contains(key));

    refresh_shards(drive, replicators, download_channels, shard_size, rng)?;
    info!(drive = %drive_key, count = leaving.len(), "Offboarded replicators from drive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::seeded_rng;
    use crate::test_support::{key, Fixture};
    use drivenet_types::{
        ActiveDataModification, CompletedDataModification, DataModificationApprovalState,
        DriveEntry,
    };

    #[test]
    fn populate_assigns_only_replicators_with_enough_storage() {
        let mut fixture = Fixture::new();
        for n in 1..=3 {
            fixture.replicator(n, 50, true);
        }
        fixture.replicator(4, 10, true);
        fixture
            .state
            .drives
            .insert(key(100), DriveEntry::new(key(100), key(101), 50, 3));

        let mut ctx = fixture.context();
        let mut rng = ctx.rng(b"populate");
        populate_drive_with_replicators(&mut ctx, &key(100), &mut rng).unwrap();
        assert_eq!(ctx.receipts.len(), 6);
        drop(ctx);

        let drive = fixture.state.drives.find(&key(100)).unwrap();
        assert_eq!(drive.replicators, [key(1), key(2), key(3)].into_iter().collect());
        assert!(fixture.state.priority_queue(WellKnownKey::DrivePriorityQueue).is_empty());

        let so = fixture.config.storage_mosaic_id;
        let sm = fixture.config.streaming_mosaic_id;
        for n in 1..=3 {
            assert_eq!(fixture.state.accounts.balance(&key(n), so), Amount(0));
            assert_eq!(fixture.state.accounts.balance(&key(n), sm), Amount(0));
        }
        assert_eq!(fixture.state.accounts.balance(&Key::ZERO, so), Amount(150));
        assert_eq!(fixture.state.accounts.balance(&key(100), sm), Amount(300));

        let tree = replicator_tree_of(&mut fixture.state, so);
        assert_eq!(tree.size(), 4);
        assert!(tree.check_tree_validity());
    }

    #[test]
    fn populate_skips_replicators_short_of_streaming_units() {
        let mut fixture = Fixture::new();
        for n in 1..=4 {
            fixture.replicator(n, 50, true);
        }
        let sm = fixture.sm();
        // Enough storage units, but only 60 of the 100 streaming units needed.
        fixture.state.accounts.debit(&key(4), sm, Amount(40)).unwrap();
        fixture
            .state
            .drives
            .insert(key(100), DriveEntry::new(key(100), key(101), 50, 4));

        let mut ctx = fixture.context();
        let mut rng = ctx.rng(b"populate");
        populate_drive_with_replicators(&mut ctx, &key(100), &mut rng).unwrap();
        drop(ctx);

        let drive = fixture.state.drives.find(&key(100)).unwrap();
        assert_eq!(drive.replicators, [key(1), key(2), key(3)].into_iter().collect());
        assert!(fixture.state.replicators.find(&key(4)).unwrap().drives.is_empty());
        assert_eq!(fixture.balance(&key(4), sm), 60);
        assert_eq!(fixture.balance(&key(4), fixture.so()), 50);

        let queue = fixture.state.priority_queue(WellKnownKey::DrivePriorityQueue);
        assert!(queue.priority_of(&key(100)).is_some());
        let tree = replicator_tree_of(&mut fixture.state, fixture.config.storage_mosaic_id);
        assert_eq!(tree.size(), 4);
        assert!(tree.check_tree_validity());
    }

    #[test]
    fn populate_queues_drive_when_short() {
        let mut fixture = Fixture::new();
        fixture.replicator(1, 50, true);
        fixture
            .state
            .drives
            .insert(key(100), DriveEntry::new(key(100), key(101), 20, 3));

        let mut ctx = fixture.context();
        let mut rng = ctx.rng(b"populate");
        populate_drive_with_replicators(&mut ctx, &key(100), &mut rng).unwrap();
        drop(ctx);

        let queue = fixture.state.priority_queue(WellKnownKey::DrivePriorityQueue);
        assert_eq!(queue.priority_of(&key(100)), Some(0.5));
    }

    #[test]
    fn onboarding_replicator_takes_fitting_drives_by_priority() {
        let mut fixture = Fixture::new();
        let so = fixture.config.storage_mosaic_id;
        for (n, size, ordered, assigned) in [(100u8, 30u64, 4u16, 3u8), (101, 100, 5, 4), (102, 25, 6, 5)] {
            let mut drive = DriveEntry::new(key(n), key(200), size, ordered);
            drive.replicators.extend((1..=assigned).map(|r| key(r + 10)));
            let priority = drive_priority(&drive, 4);
            fixture.state.drives.insert(key(n), drive);
            fixture
                .state
                .priority_queue(WellKnownKey::DrivePriorityQueue)
                .push(PriorityPair { key: key(n), priority });
        }
        fixture.replicator(1, 50, false);

        let mut ctx = fixture.context();
        let mut rng = ctx.rng(b"onboarding");
        assign_replicators_to_queued_drives(&mut ctx, &[key(1)], &mut rng).unwrap();
        drop(ctx);

        assert!(fixture.state.drives.find(&key(100)).unwrap().replicators.contains(&key(1)));
        assert!(!fixture.state.drives.find(&key(101)).unwrap().replicators.contains(&key(1)));
        assert!(!fixture.state.drives.find(&key(102)).unwrap().replicators.contains(&key(1)));

        let queue = fixture.state.priority_queue(WellKnownKey::DrivePriorityQueue);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.priority_of(&key(101)), Some(0.125));
        assert_eq!(queue.priority_of(&key(102)), Some(0.0625));
        assert_eq!(fixture.state.accounts.balance(&key(1), so), Amount(20));
        assert_eq!(replicator_tree_of(&mut fixture.state, so).size(), 1);
    }

    #[test]
    fn onboarding_replicator_skips_drives_it_cannot_stream() {
        let mut fixture = Fixture::new();
        let mut drive = DriveEntry::new(key(100), key(200), 20, 4);
        drive.replicators.extend((11..=13).map(key));
        let priority = drive_priority(&drive, 4);
        fixture.state.drives.insert(key(100), drive);
        fixture
            .state
            .priority_queue(WellKnownKey::DrivePriorityQueue)
            .push(PriorityPair { key: key(100), priority });
        fixture.replicator(1, 50, false);
        let sm = fixture.sm();
        fixture.state.accounts.debit(&key(1), sm, Amount(70)).unwrap();

        let mut ctx = fixture.context();
        let mut rng = ctx.rng(b"onboarding");
        assign_replicators_to_queued_drives(&mut ctx, &[key(1)], &mut rng).unwrap();
        drop(ctx);

        assert!(!fixture.state.drives.find(&key(100)).unwrap().replicators.contains(&key(1)));
        assert_eq!(fixture.balance(&key(1), sm), 30);
        let queue = fixture.state.priority_queue(WellKnownKey::DrivePriorityQueue);
        assert_eq!(queue.priority_of(&key(100)), Some(priority));
        assert_eq!(replicator_tree_of(&mut fixture.state, fixture.config.storage_mosaic_id).size(), 1);
    }

    #[test]
    fn both_assignment_paths_start_confirmed_storage_alike() {
        let mut fixture = Fixture::new();
        // Fresh drive with a root hash set, and a drive whose only modification was cancelled.
        let mut fresh = DriveEntry::new(key(100), key(200), 10, 2);
        fresh.root_hash = Hash256::digest(b"root");
        let mut modified = DriveEntry::new(key(101), key(200), 10, 2);
        modified.completed_data_modifications.push(CompletedDataModification {
            modification: ActiveDataModification::new(Hash256::from_low_byte(1), key(200), Hash256::ZERO, 1),
            state: DataModificationApprovalState::Cancelled,
        });
        for drive in [fresh, modified] {
            let pair = PriorityPair {
                key: drive.key,
                priority: drive_priority(&drive, 4),
            };
            fixture.state.drives.insert(drive.key, drive);
            fixture
                .state
                .priority_queue(WellKnownKey::DrivePriorityQueue)
                .push(pair);
        }
        fixture.replicator(1, 50, false);
        fixture.replicator(2, 50, true);

        let mut ctx = fixture.context();
        let mut rng = ctx.rng(b"paths");
        assign_replicators_to_queued_drives(&mut ctx, &[key(1)], &mut rng).unwrap();
        populate_drive_with_replicators(&mut ctx, &key(100), &mut rng).unwrap();
        populate_drive_with_replicators(&mut ctx, &key(101), &mut rng).unwrap();
        drop(ctx);

        let fresh = fixture.state.drives.find(&key(100)).unwrap();
        let modified = fixture.state.drives.find(&key(101)).unwrap();
        for n in 1..=2 {
            assert!(fresh.confirmed_storage_infos[&key(n)].is_running());
            assert!(!modified.confirmed_storage_infos[&key(n)].is_running());
        }
    }

    #[test]
    fn offboarding_moves_replicators_to_former() {
        let mut fixture = Fixture::new();
        for n in 1..=4 {
            fixture.replicator(n, 50, true);
        }
        fixture
            .state
            .drives
            .insert(key(100), DriveEntry::new(key(100), key(101), 10, 4));
        let mut ctx = fixture.context();
        let mut rng = seeded_rng(b"offboard", &[]);
        populate_drive_with_replicators(&mut ctx, &key(100), &mut rng).unwrap();
        let leaving: BTreeSet<Key> = [key(2)].into_iter().collect();
        offboard_replicators_from_drive(&mut ctx, &key(100), &leaving, &mut rng).unwrap();
        drop(ctx);

        let drive = fixture.state.drives.find(&key(100)).unwrap();
        assert!(!drive.replicators.contains(&key(2)));
        assert!(drive.former_replicators.contains(&key(2)));
        assert!(!drive.data_modification_shards.contains_key(&key(2)));
        assert!(drive
            .data_modification_shards
            .values()
            .all(|shard| !shard.contains(&key(2))));
        assert!(!fixture
            .state
            .replicators
            .find(&key(2))
            .unwrap()
            .drives
            .contains_key(&key(100)));
    }
}

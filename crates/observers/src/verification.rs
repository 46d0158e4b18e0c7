//! Storage verification rounds.
//!
//! Every block a share of the drives is sampled from the verification tree.
//! A sampled drive with data and no running verification splits its provers
//! into shards; each shard later reports an opinion bitset, and provers
//! without a majority lose their storage deposit to the survivors.

use crate::adapters::drive_verification_tree;
use crate::assignment::{offboard_replicators_from_drive, populate_drive_with_replicators};
use crate::context::ObserverContext;
use crate::deposits::refund_deposits_on_offboarding;
use crate::error::{ObserverError, Result};
use crate::notifications::{is_bit_set, EndDriveVerificationNotification};
use crate::rng::{next_index, shuffle, StorageRng};
use crate::service::{drive_verification_snapshot, ServiceNotification};
use drivenet_storage::EntityStore;
use drivenet_types::{Amount, DriveEntry, Hash256, Key, StorageReceiptKind, Verification};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Split provers into verification shards.
///
/// Fewer than `2 * shard_size` provers form a single shard. Otherwise the
/// provers are shuffled into `n / shard_size` shards whose sizes differ by at
/// most one, larger shards first.
pub fn split_into_shards(mut provers: Vec<Key>, shard_size: usize, rng: &mut StorageRng) -> Vec<BTreeSet<Key>> {
    let n = provers.len();
    if shard_size == 0 || n < 2 * shard_size {
        return vec![provers.into_iter().collect()];
    }
    shuffle(&mut provers, rng);
    let k = n / shard_size;
    let base = n / k;
    let larger = n % k;
    let mut provers = provers.into_iter();
    (0..k)
        .map(|i| {
            let len = base + usize::from(i < larger);
            provers.by_ref().take(len).collect()
        })
        .collect()
}

fn verification_trigger(generation_hash: &Hash256, drive_key: &Key) -> Hash256 {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(generation_hash.as_bytes());
    data.extend_from_slice(drive_key.as_bytes());
    Hash256::digest(&data)
}

fn start_drive_verification(ctx: &mut ObserverContext<'_>, drive_key: &Key, rng: &mut StorageRng) -> Result<()> {
    let now = ctx.timestamp;
    let shard_size = ctx.config.shard_size();
    let trigger = verification_trigger(&ctx.generation_hash, drive_key);
    let duration_ms = {
        let drive = ctx
            .state
            .drives
            .find(drive_key)
            .ok_or(ObserverError::DriveNotFound(*drive_key))?;
        ctx.config.verification_duration_ms(drive.size)
    };

    let drive = ctx
        .state
        .drives
        .find_mut(drive_key)
        .ok_or(ObserverError::DriveNotFound(*drive_key))?;
    if drive.completed_data_modifications.is_empty() || drive.has_running_verification(now) {
        return Ok(());
    }
    let provers: Vec<Key> = drive
        .confirmed_storage_infos
        .iter()
        .filter(|(key, info)| info.is_running() && drive.replicators.contains(*key))
        .map(|(key, _)| *key)
        .collect();
    if provers.is_empty() {
        debug!(drive = %drive_key, "No provers with confirmed storage, skipping verification");
        return Ok(());
    }

    let shards = split_into_shards(provers, shard_size, rng);
    info!(drive = %drive_key, shards = shards.len(), duration_ms, "Verification started");
    drive.verification = Some(Verification {
        verification_trigger: trigger,
        expiration: now.plus_millis(duration_ms),
        duration_ms,
        shards,
    });

    let local_serves = ctx
        .local_replicator
        .map_or(false, |local| drive.replicators.contains(&local));
    if local_serves {
        let snapshot = drive_verification_snapshot(drive, now)?;
        ctx.notify_service(ServiceNotification::VerificationStarted(snapshot));
    }
    Ok(())
}

/// Sample `size / factor` drives of the verification tree and start their verifications.
pub fn start_verifications(ctx: &mut ObserverContext<'_>) -> Result<()> {
    let factor = ctx.config.verification_factor();
    let mut rng = ctx.rng(b"verification");

    let sampled = {
        let mut tree = drive_verification_tree(ctx.state);
        let due = u64::from(tree.size()) / factor;
        let mut sampled = Vec::new();
        for _ in 0..due {
            let size = tree.size();
            if size == 0 {
                break;
            }
            let rank = next_index(&mut rng, size as usize) as u32;
            if let Some(key) = tree.extract(rank) {
                sampled.push(key);
            }
        }
        for key in &sampled {
            tree.insert(*key);
        }
        sampled
    };

    for drive_key in &sampled {
        start_drive_verification(ctx, drive_key, &mut rng)?;
    }
    Ok(())
}

/// Outcome of a finished verification shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardVerdict {
    pub failed: BTreeSet<Key>,
    pub leaving: BTreeSet<Key>,
    pub survivors: BTreeSet<Key>,
}

/// Tally a shard's opinions and decide who fails, who may leave and who stays.
///
/// Bit `j * members + i` holds judge `j`'s vote for member `i` (members in key
/// order). A member passes with a strict majority of the judges. Passed members
/// waiting to offboard may leave while more than `2 * min_replicators / 3`
/// replicators would remain.
pub fn judge_shard(
    drive: &DriveEntry,
    notification: &EndDriveVerificationNotification,
    min_replicator_count: u16,
) -> Result<ShardVerdict> {
    let verification = drive
        .verification
        .as_ref()
        .ok_or(ObserverError::NoVerification(drive.key))?;
    if verification.verification_trigger != notification.verification_trigger {
        return Err(ObserverError::VerificationTriggerMismatch(drive.key));
    }
    let shard = verification
        .shards
        .get(notification.shard_id as usize)
        .ok_or(ObserverError::InvalidShard {
            drive: drive.key,
            shard: notification.shard_id,
        })?;

    let members: Vec<Key> = shard.iter().copied().collect();
    let judges = notification.judging_keys.len();
    let required_bytes = (judges * members.len() + 7) / 8;
    if notification.opinions.len() < required_bytes {
        return Err(ObserverError::MalformedOpinions(format!(
            "expected {} opinion bytes, got {}",
            required_bytes,
            notification.opinions.len()
        )));
    }

    let failed: BTreeSet<Key> = members
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            let votes = (0..judges)
                .filter(|j| is_bit_set(&notification.opinions, j * members.len() + i))
                .count();
            2 * votes <= judges
        })
        .map(|(_, key)| *key)
        .filter(|key| drive.replicators.contains(key))
        .collect();

    let remaining = drive.replicators.len() - failed.len();
    let quota = remaining.saturating_sub(2 * min_replicator_count as usize / 3 + 1);
    let leaving: BTreeSet<Key> = drive
        .offboarding_replicators
        .iter()
        .filter(|key| shard.contains(*key) && !failed.contains(*key) && drive.replicators.contains(*key))
        .take(quota)
        .copied()
        .collect();

    let survivors = drive
        .replicators
        .iter()
        .filter(|key| !failed.contains(*key) && !leaving.contains(*key))
        .copied()
        .collect();
    Ok(ShardVerdict {
        failed,
        leaving,
        survivors,
    })
}

/// Settle one shard of a drive verification.
pub fn end_drive_verification(
    ctx: &mut ObserverContext<'_>,
    notification: &EndDriveVerificationNotification,
) -> Result<()> {
    let drive_key = notification.drive_key;
    let (verdict, size) = {
        let drive = ctx
            .state
            .drives
            .find(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;
        (
            judge_shard(drive, notification, ctx.config.min_replicator_count)?,
            drive.size,
        )
    };

    if !verdict.failed.is_empty() {
        if verdict.survivors.is_empty() {
            warn!(drive = %drive_key, failed = verdict.failed.len(), "No survivors to receive slashed deposits");
        } else {
            let storage = ctx.storage_mosaic();
            let share = (size as u128 * verdict.failed.len() as u128
                / verdict.survivors.len() as u128) as u64;
            for survivor in &verdict.survivors {
                ctx.pay_out(
                    StorageReceiptKind::VerificationSlashing,
                    &Key::ZERO,
                    survivor,
                    storage,
                    Amount(share),
                )?;
            }
        }
    }

    refund_deposits_on_offboarding(ctx, &drive_key, &verdict.leaving)?;

    let removed: BTreeSet<Key> = verdict.failed.union(&verdict.leaving).copied().collect();
    let mut rng = ctx.rng(drive_key.as_bytes());
    offboard_replicators_from_drive(ctx, &drive_key, &removed, &mut rng)?;

    if let Some(drive) = ctx.state.drives.find_mut(&drive_key) {
        if let Some(verification) = drive.verification.as_mut() {
            if let Some(shard) = verification.shards.get_mut(notification.shard_id as usize) {
                shard.clear();
            }
            if verification.is_finished() {
                drive.verification = None;
            }
        }
    }
    info!(
        drive = %drive_key,
        shard = notification.shard_id,
        failed = verdict.failed.len(),
        left = verdict.leaving.len(),
        "Verification shard settled"
    );

    populate_drive_with_replicators(ctx, &drive_key, &mut rng)?;
    if !removed.is_empty() {
        if let Some(snapshot) = ctx.local_drive_snapshot(&drive_key)? {
            ctx.notify_service(ServiceNotification::DrivesUpdated { drives: vec![snapshot] });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::notifications::pack_bits;
    use crate::rng::seeded_rng;
    use crate::test_support::{key, Fixture};
    use drivenet_types::{ActiveDataModification, CompletedDataModification, ConfirmedStorageInfo, DataModificationApprovalState, Timestamp};

    #[test]
    fn small_prover_sets_form_one_shard() {
        let provers: Vec<Key> = (1..=7).map(key).collect();
        let mut rng = seeded_rng(b"split", &[]);
        let shards = split_into_shards(provers, 4, &mut rng);
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].len(), 7);
    }

    #[test]
    fn large_prover_sets_split_evenly() {
        let provers: Vec<Key> = (1..=23).map(key).collect();
        let mut rng = seeded_rng(b"split", &[]);
        let shards = split_into_shards(provers, 5, &mut rng);
        let sizes: Vec<usize> = shards.iter().map(BTreeSet::len).collect();
        assert_eq!(sizes, vec![6, 6, 6, 5]);
        let all: BTreeSet<Key> = shards.into_iter().flatten().collect();
        assert_eq!(all.len(), 23);
    }

    fn verified_fixture() -> Fixture {
        let mut fixture = Fixture::with_config(StorageConfig {
            shard_size: 4,
            min_replicator_count: 1,
            ..StorageConfig::default()
        });
        let (xpx, so, sm) = (fixture.xpx(), fixture.so(), fixture.sm());
        for n in 1..=4u8 {
            fixture.replicator(n, 0, false);
            fixture.credit(&key(n), xpx, 100);
            let service = if n == 3 { 10 } else { 100 };
            fixture.credit(&key(n), so, service);
            fixture.credit(&key(n), sm, service);
        }
        fixture.drive_with(100, 200, 20, &[1, 2, 3, 4]);
        for mosaic in [xpx, so, sm] {
            fixture.credit(&key(100), mosaic, 100);
        }
        fixture.credit(&Key::ZERO, so, 80);

        let drive = fixture.state.drives.find_mut(&key(100)).unwrap();
        drive.offboarding_replicators.push(key(3));
        drive.verification = Some(Verification {
            verification_trigger: Hash256::from_low_byte(77),
            expiration: Timestamp(10_000),
            duration_ms: 9_000,
            shards: vec![(1..=4).map(key).collect()],
        });
        fixture
    }

    fn end_notification(opinions: Vec<u8>) -> EndDriveVerificationNotification {
        EndDriveVerificationNotification {
            drive_key: key(100),
            verification_trigger: Hash256::from_low_byte(77),
            shard_id: 0,
            judging_keys: vec![key(3), key(2)],
            opinions,
        }
    }

    #[test]
    fn failed_prover_deposit_goes_to_survivors() {
        let mut fixture = verified_fixture();
        let (xpx, so, sm) = (fixture.xpx(), fixture.so(), fixture.sm());
        let opinions = pack_bits(&[true, true, true, false, true, true, true, false]);

        let mut ctx = fixture.context();
        end_drive_verification(&mut ctx, &end_notification(opinions)).unwrap();
        drop(ctx);

        assert_eq!(fixture.balance(&Key::ZERO, so), 40);
        assert_eq!(fixture.balance(&key(100), sm), 60);
        assert_eq!(fixture.balance(&key(1), xpx), 110);
        assert_eq!(fixture.balance(&key(2), xpx), 110);
        assert_eq!(fixture.balance(&key(3), xpx), 160);
        assert_eq!(fixture.balance(&key(4), xpx), 100);
        assert_eq!(fixture.balance(&key(4), so), 100);

        let drive = fixture.state.drives.find(&key(100)).unwrap();
        assert_eq!(drive.replicators, [key(1), key(2)].into_iter().collect());
        assert!(drive.former_replicators.contains(&key(3)));
        assert!(drive.former_replicators.contains(&key(4)));
        assert!(drive.offboarding_replicators.is_empty());
        assert!(drive.verification.is_none());
    }

    #[test]
    fn stale_trigger_is_rejected() {
        let mut fixture = verified_fixture();
        let mut notification = end_notification(pack_bits(&[true; 8]));
        notification.verification_trigger = Hash256::from_low_byte(1);
        let mut ctx = fixture.context();
        let err = end_drive_verification(&mut ctx, &notification).unwrap_err();
        assert!(matches!(err, ObserverError::VerificationTriggerMismatch(_)));
    }

    #[test]
    fn short_opinions_and_bad_shard_are_rejected() {
        let mut fixture = verified_fixture();
        let mut ctx = fixture.context();
        let err = end_drive_verification(&mut ctx, &end_notification(vec![])).unwrap_err();
        assert!(matches!(err, ObserverError::MalformedOpinions(_)));

        let mut notification = end_notification(pack_bits(&[true; 8]));
        notification.shard_id = 3;
        let err = end_drive_verification(&mut ctx, &notification).unwrap_err();
        assert!(matches!(err, ObserverError::InvalidShard { shard: 3, .. }));
    }

    #[test]
    fn majority_needs_more_than_half_of_judges() {
        let fixture = verified_fixture();
        let drive = fixture.state.drives.find(&key(100)).unwrap();
        // Member 1 gets one of two votes and fails.
        let opinions = pack_bits(&[true, true, true, true, false, true, true, true]);
        let verdict = judge_shard(drive, &end_notification(opinions), 1).unwrap();
        assert_eq!(verdict.failed, [key(1)].into_iter().collect());
        assert_eq!(verdict.leaving, [key(3)].into_iter().collect());
        assert_eq!(verdict.survivors, [key(2), key(4)].into_iter().collect());
    }

    #[test]
    fn leaving_is_capped_by_minimum_replicators() {
        let fixture = verified_fixture();
        let drive = fixture.state.drives.find(&key(100)).unwrap();
        let opinions = pack_bits(&[true; 8]);
        // Four stay after judging; 2 * 6 / 3 + 1 = 5 must remain, so nobody leaves.
        let verdict = judge_shard(drive, &end_notification(opinions), 6).unwrap();
        assert!(verdict.failed.is_empty());
        assert!(verdict.leaving.is_empty());
    }

    #[test]
    fn sampled_drive_with_data_starts_verification() {
        let mut fixture = Fixture::with_config(StorageConfig {
            shard_size: 2,
            verification_interval_secs: 15,
            block_generation_time_secs: 15,
            ..StorageConfig::default()
        });
        for n in 1..=3 {
            fixture.replicator(n, 0, false);
        }
        fixture.drive_with(100, 200, 10, &[1, 2, 3]);
        fixture.local = Some(key(1));
        let now = fixture.timestamp;
        {
            let drive = fixture.state.drives.find_mut(&key(100)).unwrap();
            drive.completed_data_modifications.push(CompletedDataModification {
                modification: ActiveDataModification::new(Hash256::from_low_byte(1), key(200), Hash256::ZERO, 1),
                state: DataModificationApprovalState::Approved,
            });
            for n in 1..=3 {
                drive.confirmed_storage_infos.insert(key(n), ConfirmedStorageInfo::started_at(now));
            }
        }
        drive_verification_tree(&mut fixture.state).insert(key(100));

        let mut ctx = fixture.context();
        start_verifications(&mut ctx).unwrap();
        assert_eq!(ctx.service_notifications.len(), 1);
        drop(ctx);

        let verification = fixture
            .state
            .drives
            .find(&key(100))
            .unwrap()
            .verification
            .clone()
            .unwrap();
        assert_eq!(verification.shards.len(), 1);
        assert_eq!(verification.shards[0].len(), 3);
        assert_eq!(verification.expiration, now.plus_millis(fixture.config.verification_duration_ms(10)));
        assert_eq!(drive_verification_tree(&mut fixture.state).size(), 1);
    }
}

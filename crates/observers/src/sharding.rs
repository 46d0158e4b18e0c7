//! Download and data-modification shard maintenance.
//!
//! Download shards hold the replicators XOR-closest to the channel id once a
//! drive has more than `shard_size` replicators. Data-modification shards are
//! seeded random samples of peers, one shard per replicator.

use crate::error::{ObserverError, Result};
use crate::rng::{next_index, sample, StorageRng};
use drivenet_storage::{EntityStore, MemoryStore};
use drivenet_types::{Amount, DownloadChannelEntry, DriveEntry, Hash256, Key, ReplicatorEntry};
use std::collections::BTreeSet;
use tracing::debug;

/// The `count` keys with the smallest XOR distance to `id`.
pub fn closest_replicators<'a, I>(keys: I, id: &Hash256, count: usize) -> BTreeSet<Key>
where
    I: IntoIterator<Item = &'a Key>,
{
    let target = Key::from(*id);
    let mut sorted: Vec<Key> = keys.into_iter().copied().collect();
    sorted.sort_by_key(|key| *key ^ target);
    sorted.into_iter().take(count).collect()
}

/// Shard members of a new channel on a drive with `replicators`.
pub fn download_shard_for(replicators: &BTreeSet<Key>, id: &Hash256, shard_size: usize) -> BTreeSet<Key> {
    if replicators.len() <= shard_size {
        replicators.clone()
    } else {
        closest_replicators(replicators, id, shard_size)
    }
}

fn channel_mut<'a>(
    channels: &'a mut MemoryStore<Hash256, DownloadChannelEntry>,
    id: &Hash256,
) -> Result<&'a mut DownloadChannelEntry> {
    channels
        .find_mut(id)
        .ok_or(ObserverError::DownloadChannelNotFound(*id))
}

fn replicator_mut<'a>(
    replicators: &'a mut MemoryStore<Key, ReplicatorEntry>,
    key: &Key,
) -> Result<&'a mut ReplicatorEntry> {
    replicators
        .find_mut(key)
        .ok_or(ObserverError::ReplicatorNotFound(*key))
}

/// Fit `newcomer`, already added to `drive.replicators`, into the drive's shards.
pub fn update_shards_on_added_replicator(
    drive: &mut DriveEntry,
    newcomer: &Key,
    replicators: &mut MemoryStore<Key, ReplicatorEntry>,
    channels: &mut MemoryStore<Hash256, DownloadChannelEntry>,
    shard_size: usize,
    rng: &mut StorageRng,
) -> Result<()> {
    let replicator_count = drive.replicators.len();

    for id in &drive.download_shards {
        let channel = channel_mut(channels, id)?;
        if replicator_count <= shard_size {
            channel.shard_replicators.insert(*newcomer);
            channel.cumulative_payments.entry(*newcomer).or_insert(Amount(0));
            replicator_mut(replicators, newcomer)?.download_channels.insert(*id);
            continue;
        }

        let target = Key::from(*id);
        let most_distant = channel
            .shard_replicators
            .iter()
            .copied()
            .max_by_key(|key| *key ^ target);
        let replaced = match most_distant {
            Some(member) if (*newcomer ^ target) < (member ^ target) => Some(member),
            Some(_) => continue,
            None => None,
        };
        if let Some(member) = replaced {
            // The evicted member keeps its cumulative payment entry.
            channel.shard_replicators.remove(&member);
            if let Some(entry) = replicators.find_mut(&member) {
                entry.download_channels.remove(id);
            }
            debug!(channel = %id, evicted = %member, joined = %newcomer, "Replaced download shard member");
        }
        channel.shard_replicators.insert(*newcomer);
        channel.cumulative_payments.entry(*newcomer).or_insert(Amount(0));
        replicator_mut(replicators, newcomer)?.download_channels.insert(*id);
    }

    let others: Vec<Key> = drive
        .replicators
        .iter()
        .filter(|key| *key != newcomer)
        .copied()
        .collect();
    let shards = &mut drive.data_modification_shards;

    if replicator_count <= shard_size + 1 {
        for shard in shards.values_mut() {
            shard.add_member(*newcomer);
        }
        let own = shards.entry(*newcomer).or_default();
        for key in &others {
            own.add_member(*key);
        }
        return Ok(());
    }

    let shard_keys: Vec<Key> = shards.keys().copied().collect();
    let sample_size = shard_size * replicator_count / (replicator_count - 1);
    for owner in sample(&shard_keys, sample_size, rng) {
        let Some(shard) = shards.get_mut(&owner) else {
            continue;
        };
        if shard.len() == shard_size {
            let index = next_index(rng, shard_size);
            if let Some(replaced) = shard.actual_shard_members.keys().nth(index).copied() {
                shard.evict_member(&replaced);
            }
        }
        shard.add_member(*newcomer);
    }

    let own = shards.entry(*newcomer).or_default();
    for key in sample(&others, shard_size, rng) {
        own.add_member(key);
    }
    Ok(())
}

/// Rebuild shards after the drive's replicator set shrank.
///
/// Members no longer on the drive retire from every data-modification shard,
/// which is then topped up to `min(shard_size, n - 1)` by seeded sampling.
/// Download shards are recomputed from scratch.
pub fn refresh_shards(
    drive: &mut DriveEntry,
    replicators: &mut MemoryStore<Key, ReplicatorEntry>,
    channels: &mut MemoryStore<Hash256, DownloadChannelEntry>,
    shard_size: usize,
    rng: &mut StorageRng,
) -> Result<()> {
    let current = &drive.replicators;
    let target_size = shard_size.min(current.len().saturating_sub(1));

    for (owner, shard) in drive.data_modification_shards.iter_mut() {
        let departed: Vec<Key> = shard
            .actual_shard_members
            .keys()
            .filter(|key| !current.contains(*key))
            .copied()
            .collect();
        for key in &departed {
            shard.retire_member(key);
        }

        if shard.len() < target_size {
            let source: Vec<Key> = current
                .iter()
                .filter(|key| *key != owner && !shard.contains(key))
                .copied()
                .collect();
            for key in sample(&source, target_size - shard.len(), rng) {
                shard.add_member(key);
            }
        }
    }

    for id in &drive.download_shards {
        let members = download_shard_for(current, id, shard_size);
        let channel = channel_mut(channels, id)?;
        for key in &members {
            channel.cumulative_payments.entry(*key).or_insert(Amount(0));
        }
        for previous in channel.shard_replicators.difference(&members) {
            if let Some(entry) = replicators.find_mut(previous) {
                entry.download_channels.remove(id);
            }
        }
        for key in &members {
            replicator_mut(replicators, key)?.download_channels.insert(*id);
        }
        channel.shard_replicators = members;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::seeded_rng;
    use proptest::prelude::*;

    fn key(n: u8) -> Key {
        Key::from_low_byte(n)
    }

    fn setup(count: u8, channel: Hash256) -> (DriveEntry, MemoryStore<Key, ReplicatorEntry>, MemoryStore<Hash256, DownloadChannelEntry>) {
        let mut drive = DriveEntry::new(key(250), key(251), 10, count as u16);
        let mut replicators = MemoryStore::new();
        for n in 1..=count {
            replicators.insert(key(n), ReplicatorEntry::new(key(n), Amount(100)));
        }
        let mut channels = MemoryStore::new();
        channels.insert(channel, DownloadChannelEntry::new(channel, key(252), drive.key, 5));
        drive.download_shards.insert(channel);
        (drive, replicators, channels)
    }

    fn add_all(
        count: u8,
        shard_size: usize,
        channel: Hash256,
    ) -> (DriveEntry, MemoryStore<Key, ReplicatorEntry>, MemoryStore<Hash256, DownloadChannelEntry>) {
        let (mut drive, mut replicators, mut channels) = setup(count, channel);
        let mut rng = seeded_rng(b"shards", drive.key.as_bytes());
        for n in 1..=count {
            drive.replicators.insert(key(n));
            update_shards_on_added_replicator(
                &mut drive,
                &key(n),
                &mut replicators,
                &mut channels,
                shard_size,
                &mut rng,
            )
            .unwrap();
        }
        (drive, replicators, channels)
    }

    #[test]
    fn small_drives_put_everyone_in_every_shard() {
        let channel = Hash256::from_low_byte(77);
        let (drive, replicators, channels) = add_all(4, 5, channel);
        let shard = &channels.find(&channel).unwrap().shard_replicators;
        assert_eq!(shard.len(), 4);
        for n in 1..=4u8 {
            assert!(replicators.find(&key(n)).unwrap().download_channels.contains(&channel));
            let own = &drive.data_modification_shards[&key(n)];
            assert_eq!(own.len(), 3);
            assert!(!own.contains(&key(n)));
        }
    }

    #[test]
    fn large_drives_keep_closest_download_shard() {
        let channel = Hash256::from_low_byte(0b1010_1010);
        let (drive, replicators, channels) = add_all(40, 8, channel);
        let entry = channels.find(&channel).unwrap();
        let expected = closest_replicators(&drive.replicators, &channel, 8);
        assert_eq!(entry.shard_replicators, expected);
        for n in 1..=40u8 {
            let serves = replicators.find(&key(n)).unwrap().download_channels.contains(&channel);
            assert_eq!(serves, expected.contains(&key(n)));
        }
        // Everyone who ever served keeps a payment entry.
        assert!(entry.cumulative_payments.len() >= 8);
    }

    #[test]
    fn modification_shards_never_contain_their_owner() {
        let (drive, _, _) = add_all(30, 5, Hash256::from_low_byte(1));
        for (owner, shard) in &drive.data_modification_shards {
            assert!(!shard.contains(owner));
            assert!(shard.len() <= 6);
        }
    }

    #[test]
    fn refresh_retires_departed_members() {
        let channel = Hash256::from_low_byte(3);
        let (mut drive, mut replicators, mut channels) = add_all(6, 4, channel);
        drive.replicators.remove(&key(2));
        drive.data_modification_shards.remove(&key(2));
        let mut rng = seeded_rng(b"refresh", &[]);
        refresh_shards(&mut drive, &mut replicators, &mut channels, 4, &mut rng).unwrap();

        for (owner, shard) in &drive.data_modification_shards {
            assert!(!shard.contains(&key(2)));
            assert!(!shard.contains(owner));
            assert_eq!(shard.len(), 4);
        }
        let entry = channels.find(&channel).unwrap();
        assert!(!entry.shard_replicators.contains(&key(2)));
        assert_eq!(entry.shard_replicators.len(), 4);
        assert!(!replicators.find(&key(2)).unwrap().download_channels.contains(&channel));
    }

    proptest! {
        #[test]
        fn closest_members_beat_non_members(count in 21usize..120, id in any::<[u8; 32]>()) {
            let keys: BTreeSet<Key> = (0..count)
                .map(|n| Key::digest(&(n as u64).to_le_bytes()))
                .collect();
            let id = Hash256::from_bytes(id);
            let shard = closest_replicators(&keys, &id, 20);
            prop_assert_eq!(shard.len(), 20);
            let target = Key::from(id);
            let worst_member = shard.iter().map(|k| *k ^ target).max().unwrap();
            for key in keys.difference(&shard) {
                prop_assert!((*key ^ target) > worst_member);
            }
        }
    }
}

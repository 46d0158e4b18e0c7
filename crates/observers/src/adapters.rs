//! Bindings of the generic tree and queue onto storage state.
//!
//! Each adapter borrows only the stores it needs so callers can keep other
//! parts of the state mutably borrowed at the same time.

use drivenet_index::{AvlTree, AvlTreeStore, IndexedQueue, QueueStore};
use drivenet_storage::{AccountLedger, EntityStore, InMemoryAccountLedger, MemoryStore, StorageState};
use drivenet_types::{
    Amount, AvlTreeNode, DownloadChannelEntry, DriveEntry, Hash256, Key, MosaicId, QueueEntry,
    QueueLink, ReplicatorEntry, WellKnownKey,
};

fn head_entry(queues: &mut MemoryStore<Key, QueueEntry>, which: WellKnownKey) -> &mut QueueEntry {
    let key = which.key();
    queues.get_or_insert_with(key, || QueueEntry::new(key))
}

/// Replicators ordered by (storage units balance, key).
pub struct ReplicatorSetStore<'a> {
    replicators: &'a mut MemoryStore<Key, ReplicatorEntry>,
    head: &'a mut QueueEntry,
    accounts: &'a InMemoryAccountLedger,
    storage_mosaic: MosaicId,
}

impl AvlTreeStore for ReplicatorSetStore<'_> {
    type Ordering = (Amount, Key);

    fn ordering_key(&self, key: &Key) -> (Amount, Key) {
        (self.accounts.balance(key, self.storage_mosaic), *key)
    }

    fn load_node(&self, key: &Key) -> AvlTreeNode {
        self.replicators
            .find(key)
            .map(|entry| entry.replicators_set_node)
            .unwrap_or_default()
    }

    fn save_node(&mut self, key: &Key, node: AvlTreeNode) {
        if let Some(entry) = self.replicators.find_mut(key) {
            entry.replicators_set_node = node;
        }
    }

    fn root(&self) -> Key {
        self.head.first
    }

    fn set_root(&mut self, root: Key) {
        self.head.first = root;
    }
}

pub type ReplicatorTree<'a> = AvlTree<ReplicatorSetStore<'a>>;

pub fn replicator_tree<'a>(
    replicators: &'a mut MemoryStore<Key, ReplicatorEntry>,
    queues: &'a mut MemoryStore<Key, QueueEntry>,
    accounts: &'a InMemoryAccountLedger,
    storage_mosaic: MosaicId,
) -> ReplicatorTree<'a> {
    AvlTree::new(ReplicatorSetStore {
        replicators,
        head: head_entry(queues, WellKnownKey::ReplicatorsSetTree),
        accounts,
        storage_mosaic,
    })
}

pub fn replicator_tree_of(state: &mut StorageState, storage_mosaic: MosaicId) -> ReplicatorTree<'_> {
    let StorageState {
        replicators,
        queues,
        accounts,
        ..
    } = state;
    replicator_tree(replicators, queues, accounts, storage_mosaic)
}

/// Drives eligible for verification, ordered by key.
pub struct DriveVerificationStore<'a> {
    drives: &'a mut MemoryStore<Key, DriveEntry>,
    head: &'a mut QueueEntry,
}

impl AvlTreeStore for DriveVerificationStore<'_> {
    type Ordering = Key;

    fn ordering_key(&self, key: &Key) -> Key {
        *key
    }

    fn load_node(&self, key: &Key) -> AvlTreeNode {
        self.drives
            .find(key)
            .map(|entry| entry.verification_node)
            .unwrap_or_default()
    }

    fn save_node(&mut self, key: &Key, node: AvlTreeNode) {
        if let Some(entry) = self.drives.find_mut(key) {
            entry.verification_node = node;
        }
    }

    fn root(&self) -> Key {
        self.head.first
    }

    fn set_root(&mut self, root: Key) {
        self.head.first = root;
    }
}

pub fn drive_verification_tree(state: &mut StorageState) -> AvlTree<DriveVerificationStore<'_>> {
    let StorageState { drives, queues, .. } = state;
    AvlTree::new(DriveVerificationStore {
        drives,
        head: head_entry(queues, WellKnownKey::DriveVerificationsTree),
    })
}

/// Drives in storage payment order.
pub struct DrivePaymentQueueStore<'a> {
    drives: &'a mut MemoryStore<Key, DriveEntry>,
    head: &'a mut QueueEntry,
}

impl QueueStore for DrivePaymentQueueStore<'_> {
    fn head(&self) -> QueueEntry {
        *self.head
    }

    fn set_head(&mut self, head: QueueEntry) {
        *self.head = head;
    }

    fn load_link(&self, key: &Key) -> QueueLink {
        self.drives
            .find(key)
            .map(|entry| entry.payment_link)
            .unwrap_or_default()
    }

    fn save_link(&mut self, key: &Key, link: QueueLink) {
        if let Some(entry) = self.drives.find_mut(key) {
            entry.payment_link = link;
        }
    }
}

pub fn drive_payment_queue(state: &mut StorageState) -> IndexedQueue<DrivePaymentQueueStore<'_>> {
    let StorageState { drives, queues, .. } = state;
    IndexedQueue::new(DrivePaymentQueueStore {
        drives,
        head: head_entry(queues, WellKnownKey::DrivePaymentQueue),
    })
}

/// Download channels in approval order.
pub struct ChannelPaymentQueueStore<'a> {
    channels: &'a mut MemoryStore<Hash256, DownloadChannelEntry>,
    head: &'a mut QueueEntry,
}

impl QueueStore for ChannelPaymentQueueStore<'_> {
    fn head(&self) -> QueueEntry {
        *self.head
    }

    fn set_head(&mut self, head: QueueEntry) {
        *self.head = head;
    }

    fn load_link(&self, key: &Key) -> QueueLink {
        self.channels
            .find(&Hash256::from(*key))
            .map(|entry| entry.payment_link)
            .unwrap_or_default()
    }

    fn save_link(&mut self, key: &Key, link: QueueLink) {
        if let Some(entry) = self.channels.find_mut(&Hash256::from(*key)) {
            entry.payment_link = link;
        }
    }
}

pub fn channel_payment_queue(
    state: &mut StorageState,
) -> IndexedQueue<ChannelPaymentQueueStore<'_>> {
    let StorageState {
        download_channels,
        queues,
        ..
    } = state;
    IndexedQueue::new(ChannelPaymentQueueStore {
        channels: download_channels,
        head: head_entry(queues, WellKnownKey::DownloadChannelPaymentQueue),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivenet_storage::AccountLedger;

    const SO: MosaicId = MosaicId(2);

    #[test]
    fn replicator_tree_orders_by_storage_balance() {
        let mut state = StorageState::new();
        for (n, balance) in [(1u8, 30u64), (2, 10), (3, 20)] {
            let key = Key::from_low_byte(n);
            state.replicators.insert(key, ReplicatorEntry::new(key, Amount(balance)));
            state.accounts.credit(&key, SO, Amount(balance)).unwrap();
            replicator_tree_of(&mut state, SO).insert(key);
        }

        let tree = replicator_tree_of(&mut state, SO);
        assert_eq!(
            tree.keys(),
            vec![Key::from_low_byte(2), Key::from_low_byte(3), Key::from_low_byte(1)]
        );
        assert_eq!(tree.number_of_less(&(Amount(15), Key::ZERO)), 1);
        assert!(tree.check_tree_validity());
    }

    #[test]
    fn payment_queue_links_live_in_drives() {
        let mut state = StorageState::new();
        for n in 1..=3u8 {
            let key = Key::from_low_byte(n);
            state
                .drives
                .insert(key, DriveEntry::new(key, Key::from_low_byte(100), 1, 1));
            drive_payment_queue(&mut state).push_back(key);
        }

        let middle = state.drives.find(&Key::from_low_byte(2)).unwrap();
        assert_eq!(middle.payment_link.previous, Key::from_low_byte(1));
        assert_eq!(middle.payment_link.next, Key::from_low_byte(3));
        assert_eq!(state.queue_entry(WellKnownKey::DrivePaymentQueue).size, 3);
    }

    #[test]
    fn channel_queue_maps_ids_to_keys() {
        let mut state = StorageState::new();
        let id = Hash256::from_low_byte(9);
        state.download_channels.insert(
            id,
            DownloadChannelEntry::new(id, Key::from_low_byte(1), Key::from_low_byte(2), 10),
        );
        let mut queue = channel_payment_queue(&mut state);
        queue.push_back(Key::from(id));
        assert_eq!(queue.pop_front(), Some(Key::from(id)));
        assert!(queue.is_empty());
    }
}

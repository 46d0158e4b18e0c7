//! Fixture shared by the observer unit tests.

use crate::adapters::replicator_tree_of;
use crate::config::StorageConfig;
use crate::context::{NotifyMode, ObserverContext};
use crate::liquidity::DirectExchange;
use drivenet_storage::{AccountLedger, EntityStore, StorageState};
use drivenet_types::{Amount, DriveEntry, DriveInfo, Hash256, Height, Key, MosaicId, ReplicatorEntry, Timestamp};

pub(crate) fn key(n: u8) -> Key {
    Key::from_low_byte(n)
}

pub(crate) struct Fixture {
    pub config: StorageConfig,
    pub state: StorageState,
    pub exchange: DirectExchange,
    pub height: Height,
    pub timestamp: Timestamp,
    pub local: Option<Key>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(StorageConfig {
            shard_size: 3,
            min_replicator_count: 4,
            ..StorageConfig::default()
        })
    }

    pub fn with_config(config: StorageConfig) -> Self {
        let exchange = DirectExchange::new(config.currency_mosaic_id);
        Self {
            config,
            state: StorageState::new(),
            exchange,
            height: Height(10),
            timestamp: Timestamp(1_000),
            local: None,
        }
    }

    pub fn xpx(&self) -> MosaicId {
        self.config.currency_mosaic_id
    }

    pub fn so(&self) -> MosaicId {
        self.config.storage_mosaic_id
    }

    pub fn sm(&self) -> MosaicId {
        self.config.streaming_mosaic_id
    }

    pub fn credit(&mut self, account: &Key, mosaic: MosaicId, amount: u64) {
        self.state.accounts.credit(account, mosaic, Amount(amount)).unwrap();
    }

    pub fn balance(&self, account: &Key, mosaic: MosaicId) -> u64 {
        self.state.accounts.balance(account, mosaic).get()
    }

    /// Registers replicator `n` holding `storage` storage units and twice as many streaming units.
    pub fn replicator(&mut self, n: u8, storage: u64, in_tree: bool) {
        let (so, sm) = (self.so(), self.sm());
        self.state
            .replicators
            .insert(key(n), ReplicatorEntry::new(key(n), Amount(storage)));
        self.credit(&key(n), so, storage);
        self.credit(&key(n), sm, storage * 2);
        if in_tree {
            replicator_tree_of(&mut self.state, so).insert(key(n));
        }
    }

    /// Inserts a drive already served by `replicators`, bypassing assignment.
    pub fn drive_with(&mut self, drive: u8, owner: u8, size: u64, replicators: &[u8]) {
        let mut entry = DriveEntry::new(key(drive), key(owner), size, replicators.len() as u16);
        for n in replicators {
            entry.replicators.insert(key(*n));
            if let Some(replicator) = self.state.replicators.find_mut(&key(*n)) {
                replicator.drives.insert(key(drive), DriveInfo::default());
            }
        }
        self.state.drives.insert(key(drive), entry);
    }

    pub fn context(&mut self) -> ObserverContext<'_> {
        ObserverContext {
            height: self.height,
            timestamp: self.timestamp,
            generation_hash: Hash256::digest(b"block"),
            mode: NotifyMode::Commit,
            config: &self.config,
            state: &mut self.state,
            liquidity: &self.exchange,
            listeners: &[],
            local_replicator: self.local,
            receipts: Vec::new(),
            service_notifications: Vec::new(),
        }
    }
}

use crate::{EntityStore, InMemoryAccountLedger, MemoryStore, Result, StorageState};
use drivenet_types::Height;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::Path;

const LATEST_HEIGHT_KEY: &[u8] = b"latest_height";
const ACCOUNTS_KEY: &[u8] = b"accounts";

/// Sled-backed snapshot of the storage state, one tree per entity kind.
pub struct SledStateStore {
    db: Db,
    drives: Tree,
    replicators: Tree,
    download_channels: Tree,
    queues: Tree,
    priority_queues: Tree,
    metadata: Tree,
}

impl SledStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let drives = db.open_tree("drives")?;
        let replicators = db.open_tree("replicators")?;
        let download_channels = db.open_tree("download_channels")?;
        let queues = db.open_tree("queues")?;
        let priority_queues = db.open_tree("priority_queues")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            drives,
            replicators,
            download_channels,
            queues,
            priority_queues,
            metadata,
        })
    }

    /// Replace the persisted snapshot with `state` as of `height`.
    pub fn save(&self, state: &StorageState, height: Height) -> Result<()> {
        write_store(&self.drives, &state.drives, |key| key.0.to_vec())?;
        write_store(&self.replicators, &state.replicators, |key| key.0.to_vec())?;
        write_store(&self.download_channels, &state.download_channels, |key| {
            key.0.to_vec()
        })?;
        write_store(&self.queues, &state.queues, |key| key.0.to_vec())?;
        write_store(&self.priority_queues, &state.priority_queues, |key| {
            key.0.to_vec()
        })?;
        self.metadata
            .insert(ACCOUNTS_KEY, serde_json::to_vec(&state.accounts)?)?;
        self.metadata
            .insert(LATEST_HEIGHT_KEY, &height.0.to_be_bytes())?;
        self.flush()?;

        tracing::info!(
            height = height.0,
            drives = state.drives.len(),
            replicators = state.replicators.len(),
            "Persisted storage state snapshot"
        );
        Ok(())
    }

    /// Load the persisted snapshot; an empty database yields an empty state.
    pub fn load(&self) -> Result<StorageState> {
        let accounts = match self.metadata.get(ACCOUNTS_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => InMemoryAccountLedger::new(),
        };

        Ok(StorageState {
            drives: read_store(&self.drives, |value: &drivenet_types::DriveEntry| value.key)?,
            replicators: read_store(&self.replicators, |value: &drivenet_types::ReplicatorEntry| {
                value.key
            })?,
            download_channels: read_store(
                &self.download_channels,
                |value: &drivenet_types::DownloadChannelEntry| value.id,
            )?,
            queues: read_store(&self.queues, |value: &drivenet_types::QueueEntry| value.key)?,
            priority_queues: read_store(
                &self.priority_queues,
                |value: &drivenet_types::PriorityQueueEntry| value.key,
            )?,
            accounts,
        })
    }

    pub fn latest_height(&self) -> Result<Option<Height>> {
        Ok(self.metadata.get(LATEST_HEIGHT_KEY)?.and_then(|bytes| {
            let raw: [u8; 8] = bytes.as_ref().try_into().ok()?;
            Some(Height(u64::from_be_bytes(raw)))
        }))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn write_store<K, V>(
    tree: &Tree,
    store: &MemoryStore<K, V>,
    encode_key: impl Fn(&K) -> Vec<u8>,
) -> Result<()>
where
    K: Ord + Clone,
    V: Serialize,
{
    tree.clear()?;
    for (key, value) in store.iter() {
        tree.insert(encode_key(key), serde_json::to_vec(value)?)?;
    }
    Ok(())
}

fn read_store<K, V>(tree: &Tree, key_of: impl Fn(&V) -> K) -> Result<MemoryStore<K, V>>
where
    K: Ord + Clone,
    V: DeserializeOwned,
{
    let mut store = MemoryStore::new();
    for item in tree.iter() {
        let (_, bytes) = item?;
        let value: V = serde_json::from_slice(&bytes)?;
        store.insert(key_of(&value), value);
    }
    Ok(store)
}

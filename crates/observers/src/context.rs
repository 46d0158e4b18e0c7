use crate::config::StorageConfig;
use crate::error::{ObserverError, Result};
use crate::liquidity::LiquidityProvider;
use crate::rng::{seeded_rng, StorageRng};
use crate::service::{drive_snapshot, DriveSnapshot, ServiceNotification, StorageUpdatesListener};
use drivenet_storage::{AccountLedger, EntityStore, StorageState};
use drivenet_types::{
    Amount, Hash256, Height, Key, MosaicId, StorageReceipt, StorageReceiptKind, Timestamp,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyMode {
    Commit,
    Rollback,
}

/// Block-level inputs shared by all notifications of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub height: Height,
    pub timestamp: Timestamp,
    /// Consensus-provided entropy; every seeded RNG derives from it.
    pub generation_hash: Hash256,
}

/// Everything an observer may read or mutate while handling one notification.
pub struct ObserverContext<'a> {
    pub height: Height,
    pub timestamp: Timestamp,
    pub generation_hash: Hash256,
    pub mode: NotifyMode,
    pub config: &'a StorageConfig,
    pub state: &'a mut StorageState,
    pub liquidity: &'a dyn LiquidityProvider,
    pub listeners: &'a [Box<dyn StorageUpdatesListener>],
    pub local_replicator: Option<Key>,
    pub receipts: Vec<StorageReceipt>,
    pub service_notifications: Vec<ServiceNotification>,
}

impl<'a> ObserverContext<'a> {
    /// Fails for rollback; storage observers only run forward.
    pub fn require_commit(&self, observer: &'static str) -> Result<()> {
        match self.mode {
            NotifyMode::Commit => Ok(()),
            NotifyMode::Rollback => Err(ObserverError::InvalidObserverMode(observer)),
        }
    }

    /// RNG seeded from the block entropy and `salt`.
    pub fn rng(&self, salt: &[u8]) -> StorageRng {
        seeded_rng(self.generation_hash.as_bytes(), salt)
    }

    pub fn currency(&self) -> MosaicId {
        self.config.currency_mosaic_id
    }

    pub fn storage_mosaic(&self) -> MosaicId {
        self.config.storage_mosaic_id
    }

    pub fn streaming_mosaic(&self) -> MosaicId {
        self.config.streaming_mosaic_id
    }

    pub fn balance(&self, account: &Key, mosaic: MosaicId) -> Amount {
        self.state.accounts.balance(account, mosaic)
    }

    /// Move `amount` of one mosaic between accounts.
    pub fn transfer(
        &mut self,
        kind: StorageReceiptKind,
        from: &Key,
        to: &Key,
        mosaic: MosaicId,
        amount: Amount,
    ) -> Result<()> {
        if amount.0 == 0 {
            return Ok(());
        }
        self.state.accounts.transfer(from, to, mosaic, amount)?;
        self.receipts
            .push(StorageReceipt::new(kind, *from, *to, mosaic, amount));
        Ok(())
    }

    /// Sell `amount` of a service mosaic held by `from`, paying currency to `to`.
    pub fn pay_out(
        &mut self,
        kind: StorageReceiptKind,
        from: &Key,
        to: &Key,
        service_mosaic: MosaicId,
        amount: Amount,
    ) -> Result<()> {
        if amount.0 == 0 {
            return Ok(());
        }
        self.liquidity
            .debit_mosaics(&mut self.state.accounts, from, to, service_mosaic, amount)?;
        let currency = self.currency();
        self.receipts
            .push(StorageReceipt::new(kind, *from, *to, currency, amount));
        Ok(())
    }

    /// Charge `from` in currency, crediting `amount` of a service mosaic to `to`.
    pub fn pay_in(
        &mut self,
        kind: StorageReceiptKind,
        from: &Key,
        to: &Key,
        service_mosaic: MosaicId,
        amount: Amount,
    ) -> Result<()> {
        if amount.0 == 0 {
            return Ok(());
        }
        self.liquidity
            .credit_mosaics(&mut self.state.accounts, from, to, service_mosaic, amount)?;
        self.receipts
            .push(StorageReceipt::new(kind, *from, *to, service_mosaic, amount));
        Ok(())
    }

    pub fn notify_service(&mut self, notification: ServiceNotification) {
        if self.local_replicator.is_some() {
            self.service_notifications.push(notification);
        }
    }

    pub fn is_local(&self, key: &Key) -> bool {
        self.local_replicator.as_ref() == Some(key)
    }

    /// Snapshot of a drive the local replicator serves, `None` otherwise.
    pub fn local_drive_snapshot(&self, drive_key: &Key) -> Result<Option<DriveSnapshot>> {
        let Some(local) = self.local_replicator else {
            return Ok(None);
        };
        let serves = self
            .state
            .drives
            .find(drive_key)
            .map(|drive| drive.replicators.contains(&local))
            .unwrap_or(false);
        if !serves {
            return Ok(None);
        }
        drive_snapshot(&*self.state, drive_key, &local, self.timestamp).map(Some)
    }
}

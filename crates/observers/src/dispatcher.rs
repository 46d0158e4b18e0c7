//! Routes storage notifications to their observers.

use crate::config::StorageConfig;
use crate::context::{BlockContext, NotifyMode, ObserverContext};
use crate::download::{
    download_approval, download_channel_refund, download_payment, finish_download,
    open_download_channel, process_download_channels,
};
use crate::drive::{drive_closure, prepare_drive};
use crate::error::Result;
use crate::liquidity::{DirectExchange, LiquidityProvider};
use crate::modification::{
    approve_data_modification, cancel_data_modification, request_data_modification,
    single_approval,
};
use crate::notifications::StorageNotification;
use crate::replicator::{cleanup_replicators, onboard_replicator, request_offboarding, update_shards};
use crate::service::{ServiceNotification, ServiceNotificationSink, StorageUpdatesListener};
use crate::storage_payment::process_storage_payments;
use crate::stream::{finish_stream, start_stream, stream_payment};
use crate::verification::{end_drive_verification, start_verifications};
use drivenet_storage::StorageState;
use drivenet_types::{Key, StorageReceipt};
use tracing::{debug, warn};

/// Side effects of one notification besides the state changes.
#[derive(Debug, Default)]
pub struct BlockOutcome {
    pub receipts: Vec<StorageReceipt>,
    pub service_notifications: Vec<ServiceNotification>,
}

/// The storage plugin: configuration plus the collaborators every observer shares.
pub struct StorageObservers {
    config: StorageConfig,
    liquidity: Box<dyn LiquidityProvider>,
    listeners: Vec<Box<dyn StorageUpdatesListener>>,
    sink: Option<Box<dyn ServiceNotificationSink>>,
    local_replicator: Option<Key>,
}

impl StorageObservers {
    pub fn new(config: StorageConfig, liquidity: Box<dyn LiquidityProvider>) -> Self {
        Self {
            config,
            liquidity,
            listeners: Vec::new(),
            sink: None,
            local_replicator: None,
        }
    }

    /// Observers with a one-to-one currency exchange.
    pub fn with_direct_exchange(config: StorageConfig) -> Self {
        let exchange = DirectExchange::new(config.currency_mosaic_id);
        Self::new(config, Box::new(exchange))
    }

    pub fn with_listener(mut self, listener: Box<dyn StorageUpdatesListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Service notifications are only produced when a local replicator is set.
    pub fn with_local_replicator(mut self, key: Key, sink: Box<dyn ServiceNotificationSink>) -> Self {
        self.local_replicator = Some(key);
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn local_replicator(&self) -> Option<Key> {
        self.local_replicator
    }

    /// Apply one notification to `state`.
    ///
    /// Errors are fatal for the block: the caller must discard `state`.
    pub fn notify(
        &self,
        state: &mut StorageState,
        block: &BlockContext,
        mode: NotifyMode,
        notification: &StorageNotification,
    ) -> Result<BlockOutcome> {
        if !self.config.enabled {
            debug!(notification = notification.name(), "Storage observers disabled");
            return Ok(BlockOutcome::default());
        }

        let mut ctx = ObserverContext {
            height: block.height,
            timestamp: block.timestamp,
            generation_hash: block.generation_hash,
            mode,
            config: &self.config,
            state,
            liquidity: self.liquidity.as_ref(),
            listeners: &self.listeners,
            local_replicator: self.local_replicator,
            receipts: Vec::new(),
            service_notifications: Vec::new(),
        };
        ctx.require_commit(notification.name())?;
        if let Err(err) = dispatch(&mut ctx, notification) {
            warn!(notification = notification.name(), error = %err, "Storage observer failed");
            return Err(err);
        }

        let outcome = BlockOutcome {
            receipts: ctx.receipts,
            service_notifications: ctx.service_notifications,
        };
        if let Some(sink) = &self.sink {
            for event in &outcome.service_notifications {
                sink.publish(event);
            }
        }
        Ok(outcome)
    }

    /// Apply a block's notifications in order, collecting their outcomes.
    pub fn notify_all(
        &self,
        state: &mut StorageState,
        block: &BlockContext,
        notifications: &[StorageNotification],
    ) -> Result<BlockOutcome> {
        let mut outcome = BlockOutcome::default();
        for notification in notifications {
            let step = self.notify(state, block, NotifyMode::Commit, notification)?;
            outcome.receipts.extend(step.receipts);
            outcome.service_notifications.extend(step.service_notifications);
        }
        Ok(outcome)
    }
}

fn dispatch(ctx: &mut ObserverContext<'_>, notification: &StorageNotification) -> Result<()> {
    match notification {
        StorageNotification::PrepareDrive(n) => prepare_drive(ctx, n),
        StorageNotification::DriveClosure(n) => drive_closure(ctx, n),
        StorageNotification::Download(n) => open_download_channel(ctx, n),
        StorageNotification::DownloadPayment(n) => download_payment(ctx, n),
        StorageNotification::FinishDownload(n) => finish_download(ctx, n),
        StorageNotification::DownloadApproval(n) => download_approval(ctx, n),
        StorageNotification::DownloadChannelRefund(n) => download_channel_refund(ctx, n),
        StorageNotification::DataModification(n) => request_data_modification(ctx, n),
        StorageNotification::DataModificationApproval(n) => approve_data_modification(ctx, n),
        StorageNotification::DataModificationSingleApproval(n) => single_approval(ctx, n),
        StorageNotification::DataModificationCancel(n) => cancel_data_modification(ctx, n),
        StorageNotification::ReplicatorOnboarding(n) => onboard_replicator(ctx, n),
        StorageNotification::ReplicatorOffboarding(n) => request_offboarding(ctx, n),
        StorageNotification::ReplicatorsCleanup(n) => cleanup_replicators(ctx, n),
        StorageNotification::StreamStart(n) => start_stream(ctx, n),
        StorageNotification::StreamPayment(n) => stream_payment(ctx, n),
        StorageNotification::StreamFinish(n) => finish_stream(ctx, n),
        StorageNotification::EndDriveVerification(n) => end_drive_verification(ctx, n),
        StorageNotification::ShardsUpdate(n) => update_shards(ctx, n),
        StorageNotification::Block => {
            start_verifications(ctx)?;
            process_storage_payments(ctx)?;
            process_download_channels(ctx)
        }
    }
}

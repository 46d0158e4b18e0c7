//! Replicator deposit refunds.
//!
//! A replicator joining a drive locks `size` storage units in the void account
//! and `2 * size` streaming units in the drive account. Both come back when the
//! drive closes; on offboarding the streaming part is slashed by the data the
//! replicator confirmed.

use crate::context::ObserverContext;
use crate::error::{ObserverError, Result};
use drivenet_storage::EntityStore;
use drivenet_types::{megabytes_from_bytes, Amount, Key, StorageReceiptKind};
use std::collections::BTreeSet;
use tracing::warn;

/// Return deposits as service units when a drive closes.
pub fn refund_deposits_on_closure(
    ctx: &mut ObserverContext<'_>,
    drive_key: &Key,
    replicators: &BTreeSet<Key>,
) -> Result<()> {
    let size = ctx
        .state
        .drives
        .find(drive_key)
        .ok_or(ObserverError::DriveNotFound(*drive_key))?
        .size;
    let storage = ctx.storage_mosaic();
    let streaming = ctx.streaming_mosaic();

    for replicator in replicators {
        for (from, mosaic, deposit) in [
            (Key::ZERO, storage, size),
            (*drive_key, streaming, size.saturating_mul(2)),
        ] {
            let available = ctx.balance(&from, mosaic).get();
            if available < deposit {
                warn!(
                    drive = %drive_key,
                    replicator = %replicator,
                    mosaic = %mosaic,
                    deposit,
                    available,
                    "Deposit refund exceeds the holding balance"
                );
            }
            ctx.transfer(
                StorageReceiptKind::DriveDepositRefund,
                &from,
                replicator,
                mosaic,
                Amount(deposit.min(available)),
            )?;
        }
    }
    Ok(())
}

/// Streaming units withheld from a leaving replicator: twice the smaller of
/// its confirmed used size and the drive's used size, in megabytes.
pub fn offboarding_slashing(confirmed_used_size: Option<u64>, used_size_bytes: u64) -> u64 {
    let basis = confirmed_used_size
        .map(|confirmed| confirmed.min(used_size_bytes))
        .unwrap_or(used_size_bytes);
    megabytes_from_bytes(basis.saturating_mul(2))
}

/// Return deposits as currency to replicators leaving a live drive.
pub fn refund_deposits_on_offboarding(
    ctx: &mut ObserverContext<'_>,
    drive_key: &Key,
    replicators: &BTreeSet<Key>,
) -> Result<()> {
    if replicators.is_empty() {
        return Ok(());
    }
    let (size, refunds) = {
        let drive = ctx
            .state
            .drives
            .find(drive_key)
            .ok_or(ObserverError::DriveNotFound(*drive_key))?;
        let deposit = drive.size.saturating_mul(2);
        let mut refunds = Vec::with_capacity(replicators.len());
        for replicator in replicators {
            let slashing = offboarding_slashing(
                drive.confirmed_used_sizes.get(replicator).copied(),
                drive.used_size_bytes,
            );
            if slashing > deposit {
                return Err(ObserverError::SlashingExceedsDeposit { deposit, slashing });
            }
            refunds.push((*replicator, deposit - slashing));
        }
        (drive.size, refunds)
    };

    let storage = ctx.storage_mosaic();
    let streaming = ctx.streaming_mosaic();
    for (replicator, streaming_refund) in refunds {
        ctx.pay_out(
            StorageReceiptKind::DriveDepositRefund,
            &Key::ZERO,
            &replicator,
            storage,
            Amount(size),
        )?;
        ctx.pay_out(
            StorageReceiptKind::DriveDepositRefund,
            drive_key,
            &replicator,
            streaming,
            Amount(streaming_refund),
        )?;
    }
    Ok(())
}

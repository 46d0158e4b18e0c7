//! Periodic storage billing.

use crate::adapters::drive_payment_queue;
use crate::closure::{close_drive, ClosureReason};
use crate::context::ObserverContext;
use crate::error::{ObserverError, Result};
use drivenet_storage::EntityStore;
use drivenet_types::{Amount, Height, Key, StorageReceiptKind};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use tracing::{debug, info};

/// `size * time / period` with a wide intermediate, floored.
pub fn prorated_storage_payment(size: u64, time_in_confirmed_ms: u64, period_ms: u64) -> u64 {
    if period_ms == 0 {
        return 0;
    }
    let payment =
        BigUint::from(size) * BigUint::from(time_in_confirmed_ms) / BigUint::from(period_ms);
    payment.to_u64().unwrap_or(u64::MAX)
}

/// Pay every replicator for its confirmed storage time and reset the timers.
///
/// Payments come from the drive's storage units and are capped by what the
/// drive still holds.
pub fn pay_for_storage(ctx: &mut ObserverContext<'_>, drive_key: &Key) -> Result<()> {
    let now = ctx.timestamp;
    let period = ctx.config.storage_billing_period_ms();
    let payments: Vec<(Key, u64)> = {
        let drive = ctx
            .state
            .drives
            .find_mut(drive_key)
            .ok_or(ObserverError::DriveNotFound(*drive_key))?;
        let size = drive.size;
        drive
            .confirmed_storage_infos
            .iter_mut()
            .map(|(replicator, info)| {
                info.accumulate(now);
                let payment =
                    prorated_storage_payment(size, info.time_in_confirmed_storage, period);
                info.time_in_confirmed_storage = 0;
                (*replicator, payment)
            })
            .collect()
    };

    let storage = ctx.storage_mosaic();
    for (replicator, payment) in payments {
        let available = ctx.balance(drive_key, storage).get();
        ctx.pay_out(
            StorageReceiptKind::StoragePayment,
            drive_key,
            &replicator,
            storage,
            Amount(payment.min(available)),
        )?;
    }
    Ok(())
}

/// Bill the drives at the front of the payment queue that are due.
///
/// Each drive is visited at most once per block. A drive that can still
/// cover a full period for all ordered replicators goes to the back of the
/// queue; any other drive is closed.
pub fn process_storage_payments(ctx: &mut ObserverContext<'_>) -> Result<()> {
    if ctx.height < Height(2) {
        return Ok(());
    }
    let now = ctx.timestamp;
    let period = ctx.config.storage_billing_period_ms();
    let storage = ctx.storage_mosaic();
    let passes = drive_payment_queue(ctx.state).len();

    for _ in 0..passes {
        let front = drive_payment_queue(ctx.state).front();
        if front.is_zero() {
            break;
        }
        let last_payment = ctx
            .state
            .drives
            .find(&front)
            .ok_or(ObserverError::DriveNotFound(front))?
            .last_payment;
        if now.millis_since(last_payment) < period {
            break;
        }

        drive_payment_queue(ctx.state).pop_front();
        pay_for_storage(ctx, &front)?;

        let (required, drive_size) = {
            let drive = ctx
                .state
                .drives
                .find(&front)
                .ok_or(ObserverError::DriveNotFound(front))?;
            (
                drive.size.saturating_mul(drive.replicator_count as u64),
                drive.size,
            )
        };
        let balance = ctx.balance(&front, storage).get();
        if balance >= required {
            if let Some(drive) = ctx.state.drives.find_mut(&front) {
                drive.last_payment = now;
            }
            drive_payment_queue(ctx.state).push_back(front);
            debug!(drive = %front, balance, "Drive continues after storage payment");
        } else {
            info!(drive = %front, balance, required, size = drive_size, "Drive cannot pay for storage, closing");
            close_drive(ctx, &front, ClosureReason::Underfunded)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{key, Fixture};
    use drivenet_types::{ConfirmedStorageInfo, Timestamp};

    #[test]
    fn prorated_payment_floors() {
        assert_eq!(prorated_storage_payment(100, 1_000, 1_000), 100);
        assert_eq!(prorated_storage_payment(100, 999, 1_000), 99);
        assert_eq!(prorated_storage_payment(3, 1, 2), 1);
        assert_eq!(prorated_storage_payment(100, 0, 1_000), 0);
        assert_eq!(prorated_storage_payment(100, 10, 0), 0);
    }

    #[test]
    fn prorated_payment_does_not_overflow() {
        let week = 7 * 24 * 60 * 60 * 1000u64;
        assert_eq!(prorated_storage_payment(u64::MAX, week, week), u64::MAX);
        assert_eq!(prorated_storage_payment(u64::MAX, week / 2, week), u64::MAX / 2);
    }

    #[test]
    fn replicators_are_paid_for_confirmed_time() {
        let mut fixture = Fixture::new();
        let (xpx, so) = (fixture.xpx(), fixture.so());
        let period = fixture.config.storage_billing_period_ms();
        fixture.replicator(1, 0, false);
        fixture.replicator(2, 0, false);
        fixture.drive_with(100, 200, 10, &[1, 2]);
        fixture.credit(&key(100), so, 12);
        fixture.timestamp = Timestamp(period);
        {
            let drive = fixture.state.drives.find_mut(&key(100)).unwrap();
            drive
                .confirmed_storage_infos
                .insert(key(1), ConfirmedStorageInfo::started_at(Timestamp(period / 2)));
            drive
                .confirmed_storage_infos
                .insert(key(2), ConfirmedStorageInfo::started_at(Timestamp(0)));
        }

        let mut ctx = fixture.context();
        pay_for_storage(&mut ctx, &key(100)).unwrap();
        drop(ctx);

        assert_eq!(fixture.balance(&key(1), xpx), 5);
        // Capped by what is left on the drive.
        assert_eq!(fixture.balance(&key(2), xpx), 7);
        assert_eq!(fixture.balance(&key(100), so), 0);
        let drive = fixture.state.drives.find(&key(100)).unwrap();
        assert!(drive
            .confirmed_storage_infos
            .values()
            .all(|info| info.time_in_confirmed_storage == 0 && info.is_running()));
    }

    #[test]
    fn billing_waits_for_second_block() {
        let mut fixture = Fixture::new();
        fixture.height = Height(1);
        fixture.timestamp = Timestamp(fixture.config.storage_billing_period_ms() * 2);
        fixture.drive_with(100, 200, 10, &[]);
        drive_payment_queue(&mut fixture.state).push_back(key(100));

        let mut ctx = fixture.context();
        process_storage_payments(&mut ctx).unwrap();
        drop(ctx);

        assert!(fixture.state.drives.contains(&key(100)));
    }
}

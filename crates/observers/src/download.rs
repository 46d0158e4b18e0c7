//! Download channel lifecycle and periodic approval rounds.

use crate::adapters::channel_payment_queue;
use crate::context::ObserverContext;
use crate::error::{ObserverError, Result};
use crate::notifications::{
    DownloadApprovalNotification, DownloadChannelRefundNotification, DownloadNotification,
    DownloadPaymentNotification, FinishDownloadNotification,
};
use crate::service::{download_channel_snapshot, ServiceNotification};
use crate::sharding::download_shard_for;
use drivenet_storage::{EntityStore, StorageState};
use drivenet_types::{Amount, DownloadChannelEntry, Hash256, Key, StorageReceiptKind};
use tracing::{debug, info, warn};

fn serves_channel(local: Option<Key>, channel: &DownloadChannelEntry) -> bool {
    local.map_or(false, |local| channel.shard_replicators.contains(&local))
}

fn ensure_queued(ctx: &mut ObserverContext<'_>, id: &Hash256) {
    let mut queue = channel_payment_queue(ctx.state);
    let key = Key::from(*id);
    if !queue.contains(&key) {
        queue.push_back(key);
    }
}

/// Consumer tops up the channel: streaming units bought with currency plus the feedback fee.
fn fund_channel(ctx: &mut ObserverContext<'_>, consumer: &Key, id: &Hash256, download_size: u64, fee: Amount) -> Result<()> {
    let channel_account = Key::from(*id);
    let streaming = ctx.streaming_mosaic();
    let currency = ctx.currency();
    ctx.pay_in(
        StorageReceiptKind::DownloadChannelPayment,
        consumer,
        &channel_account,
        streaming,
        Amount(download_size),
    )?;
    ctx.transfer(StorageReceiptKind::FeedbackFee, consumer, &channel_account, currency, fee)
}

/// Open a channel served by the drive replicators XOR-closest to its id.
pub fn open_download_channel(ctx: &mut ObserverContext<'_>, notification: &DownloadNotification) -> Result<()> {
    let id = notification.id;
    let shard_size = ctx.config.shard_size();
    let now = ctx.timestamp;
    {
        let StorageState {
            drives,
            replicators,
            download_channels,
            ..
        } = &mut *ctx.state;
        if download_channels.contains(&id) {
            return Err(ObserverError::DownloadChannelExists(id));
        }
        let drive = drives
            .find_mut(&notification.drive_key)
            .ok_or(ObserverError::DriveNotFound(notification.drive_key))?;

        let mut channel = DownloadChannelEntry::new(
            id,
            notification.consumer,
            notification.drive_key,
            notification.download_size,
        );
        channel.list_of_public_keys = notification.whitelisted_public_keys.clone();
        channel.last_download_approval_initiated = now;
        channel.shard_replicators = download_shard_for(&drive.replicators, &id, shard_size);
        for key in &channel.shard_replicators {
            channel.cumulative_payments.insert(*key, Amount(0));
            replicators
                .find_mut(key)
                .ok_or(ObserverError::ReplicatorNotFound(*key))?
                .download_channels
                .insert(id);
        }
        drive.download_shards.insert(id);
        download_channels.insert(id, channel);
    }
    channel_payment_queue(ctx.state).push_back(Key::from(id));

    fund_channel(
        ctx,
        &notification.consumer,
        &id,
        notification.download_size,
        notification.feedback_fee_amount,
    )?;

    if let Some(local) = ctx.local_replicator {
        let snapshot = ctx
            .state
            .download_channels
            .find(&id)
            .and_then(|channel| download_channel_snapshot(&local, channel));
        if let Some(snapshot) = snapshot {
            ctx.notify_service(ServiceNotification::DownloadChannelOpened(snapshot));
        }
    }
    info!(channel = %id, drive = %notification.drive_key, size = notification.download_size, "Download channel opened");
    Ok(())
}

/// Prolong a channel by `download_size` and one more approval round.
pub fn download_payment(ctx: &mut ObserverContext<'_>, notification: &DownloadPaymentNotification) -> Result<()> {
    let id = notification.download_channel_id;
    let consumer = {
        let channel = ctx
            .state
            .download_channels
            .find_mut(&id)
            .ok_or(ObserverError::DownloadChannelNotFound(id))?;
        channel.download_size_mb = channel.download_size_mb.saturating_add(notification.download_size);
        channel.download_approval_count_left = channel.download_approval_count_left.saturating_add(1);
        channel.consumer
    };
    fund_channel(ctx, &consumer, &id, notification.download_size, notification.feedback_fee_amount)?;
    ensure_queued(ctx, &id);
    debug!(channel = %id, added = notification.download_size, "Download channel prolonged");
    Ok(())
}

/// The consumer is done; one last approval round settles the channel.
pub fn finish_download(ctx: &mut ObserverContext<'_>, notification: &FinishDownloadNotification) -> Result<()> {
    let id = notification.download_channel_id;
    let currency = ctx.currency();
    let (consumer, local_serves) = {
        let channel = ctx
            .state
            .download_channels
            .find_mut(&id)
            .ok_or(ObserverError::DownloadChannelNotFound(id))?;
        channel.finish_published = true;
        channel.download_approval_count_left = channel.download_approval_count_left.saturating_add(1);
        (channel.consumer, serves_channel(ctx.local_replicator, channel))
    };
    ctx.transfer(
        StorageReceiptKind::FeedbackFee,
        &consumer,
        &Key::from(id),
        currency,
        notification.feedback_fee_amount,
    )?;
    ensure_queued(ctx, &id);
    if local_serves {
        ctx.notify_service(ServiceNotification::DownloadFinished { channel: id });
    }
    debug!(channel = %id, "Download finish published");
    Ok(())
}

/// Upper median of the reported values.
fn upper_median(mut values: Vec<u64>) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[values.len() / 2])
}

/// Per-replicator payments `median - already_paid`, scaled down to `balance` when short.
///
/// Scaled shares are floored; the units lost to rounding go one each to the
/// replicators still below their request, in judged-key order, so a short
/// channel pays out its whole balance.
pub fn download_approval_payments(
    medians: &[(Key, u64, u64)],
    balance: u64,
) -> Vec<(Key, u64)> {
    let requested: Vec<u128> = medians
        .iter()
        .map(|(_, median, paid)| u128::from(median.saturating_sub(*paid)))
        .collect();
    let total: u128 = requested.iter().sum();
    let balance = u128::from(balance);
    if total <= balance {
        return medians
            .iter()
            .zip(&requested)
            .map(|((key, _, _), payment)| (*key, *payment as u64))
            .collect();
    }

    let mut scaled: Vec<u128> = requested
        .iter()
        .map(|payment| payment * balance / total)
        .collect();
    let mut remainder = balance - scaled.iter().sum::<u128>();
    for (share, payment) in scaled.iter_mut().zip(&requested) {
        if remainder == 0 {
            break;
        }
        if *share < *payment {
            *share += 1;
            remainder -= 1;
        }
    }
    medians
        .iter()
        .zip(scaled)
        .map(|((key, _, _), share)| (*key, share as u64))
        .collect()
}

/// Pay replicators for download work agreed on by the channel's judges.
pub fn download_approval(ctx: &mut ObserverContext<'_>, notification: &DownloadApprovalNotification) -> Result<()> {
    let id = notification.download_channel_id;
    let channel_account = Key::from(id);
    let streaming = ctx.streaming_mosaic();
    let rows = notification.opinions.rows()?;
    let judged = notification.opinions.judged_keys();

    let medians: Vec<(Key, u64, u64)> = {
        let channel = ctx
            .state
            .download_channels
            .find(&id)
            .ok_or(ObserverError::DownloadChannelNotFound(id))?;
        if channel.download_approval_initiation_event != notification.approval_trigger {
            warn!(
                channel = %id,
                trigger = %notification.approval_trigger,
                "Ignoring download approval for a round that is not current"
            );
            return Ok(());
        }
        judged
            .iter()
            .enumerate()
            .filter_map(|(column, key)| {
                let paid = channel.cumulative_payments.get(key)?;
                let median = upper_median(rows.iter().filter_map(|row| row[column]).collect())?;
                Some((*key, median, paid.get()))
            })
            .collect()
    };

    let balance = ctx.balance(&channel_account, streaming).get();
    for (replicator, payment) in download_approval_payments(&medians, balance) {
        ctx.pay_out(
            StorageReceiptKind::DownloadWorkPayment,
            &channel_account,
            &replicator,
            streaming,
            Amount(payment),
        )?;
        if let Some(channel) = ctx.state.download_channels.find_mut(&id) {
            let paid = channel.cumulative_payments.entry(replicator).or_default();
            *paid = paid.saturating_add(Amount(payment));
        }
    }
    info!(channel = %id, replicators = medians.len(), "Download approval settled");
    Ok(())
}

/// Return what is left on the channel to the consumer and tear it down.
pub fn download_channel_refund(
    ctx: &mut ObserverContext<'_>,
    notification: &DownloadChannelRefundNotification,
) -> Result<()> {
    let id = notification.download_channel_id;
    let channel_account = Key::from(id);
    let consumer = ctx
        .state
        .download_channels
        .find(&id)
        .ok_or(ObserverError::DownloadChannelNotFound(id))?
        .consumer;

    let streaming = ctx.streaming_mosaic();
    let currency = ctx.currency();
    let remaining = ctx.balance(&channel_account, streaming);
    ctx.pay_out(
        StorageReceiptKind::DownloadChannelRefund,
        &channel_account,
        &consumer,
        streaming,
        remaining,
    )?;
    let fees = ctx.balance(&channel_account, currency);
    ctx.transfer(
        StorageReceiptKind::DownloadChannelRefund,
        &channel_account,
        &consumer,
        currency,
        fees,
    )?;

    channel_payment_queue(ctx.state).remove(&channel_account);
    let StorageState {
        drives,
        replicators,
        download_channels,
        ..
    } = &mut *ctx.state;
    let channel = download_channels
        .remove(&id)
        .ok_or(ObserverError::DownloadChannelNotFound(id))?;
    // The drive may already be closed.
    if let Some(drive) = drives.find_mut(&channel.drive) {
        drive.download_shards.remove(&id);
    }
    for key in channel.shard_replicators.iter().chain(channel.cumulative_payments.keys()) {
        if let Some(replicator) = replicators.find_mut(key) {
            replicator.download_channels.remove(&id);
        }
    }
    info!(channel = %id, refunded = remaining.get(), "Download channel refunded");
    Ok(())
}

fn approval_event(generation_hash: &Hash256, id: &Hash256, height: u64) -> Hash256 {
    let mut data = Vec::with_capacity(72);
    data.extend_from_slice(generation_hash.as_bytes());
    data.extend_from_slice(id.as_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    Hash256::digest(&data)
}

/// Start approval rounds on channels whose billing period has elapsed.
pub fn process_download_channels(ctx: &mut ObserverContext<'_>) -> Result<()> {
    let now = ctx.timestamp;
    let period = ctx.config.download_billing_period_ms();
    let passes = channel_payment_queue(ctx.state).len();

    for _ in 0..passes {
        let front = channel_payment_queue(ctx.state).front();
        if front.is_zero() {
            break;
        }
        let id = Hash256::from(front);
        let last_initiated = ctx
            .state
            .download_channels
            .find(&id)
            .ok_or(ObserverError::DownloadChannelNotFound(id))?
            .last_download_approval_initiated;
        if now.millis_since(last_initiated) < period {
            break;
        }
        channel_payment_queue(ctx.state).pop_front();

        let event = approval_event(&ctx.generation_hash, &id, ctx.height.get());
        let local = ctx.local_replicator;
        let (initiated, requeue, local_serves) = {
            let channel = ctx
                .state
                .download_channels
                .find_mut(&id)
                .ok_or(ObserverError::DownloadChannelNotFound(id))?;
            let initiated = channel.download_approval_count_left > 0;
            if initiated {
                channel.download_approval_count_left -= 1;
                channel.download_approval_initiation_event = event;
                channel.last_download_approval_initiated = now;
            }
            (
                initiated,
                channel.download_approval_count_left > 0 && !channel.finish_published,
                serves_channel(local, channel),
            )
        };

        if initiated && local_serves {
            ctx.notify_service(ServiceNotification::DownloadApprovalInitiated { channel: id, event });
        }
        if requeue {
            channel_payment_queue(ctx.state).push_back(front);
        }
        debug!(channel = %id, initiated, requeue, "Download channel tick");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::notifications::{pack_bits, OpinionMatrix};
    use crate::sharding::closest_replicators;
    use crate::test_support::{key, Fixture};
    use drivenet_types::Timestamp;
    use proptest::prelude::*;

    fn channel_id(n: u8) -> Hash256 {
        Hash256::from_low_byte(n)
    }

    fn fixture_with_channels(counts: &[(u8, u16, u64)]) -> Fixture {
        let mut fixture = Fixture::new();
        fixture.drive_with(100, 200, 10, &[]);
        for (n, count, last) in counts {
            let id = channel_id(*n);
            let mut channel = DownloadChannelEntry::new(id, key(201), key(100), 10);
            channel.download_approval_count_left = *count;
            channel.last_download_approval_initiated = Timestamp(*last);
            fixture.state.download_channels.insert(id, channel);
            channel_payment_queue(&mut fixture.state).push_back(Key::from(id));
        }
        fixture
    }

    fn queue_bytes(fixture: &mut Fixture) -> Vec<u8> {
        channel_payment_queue(&mut fixture.state)
            .keys()
            .iter()
            .map(|key| key.0[31])
            .collect()
    }

    #[test]
    fn tick_drops_exhausted_channels() {
        let period = StorageConfig::default().download_billing_period_ms();
        let mut fixture = fixture_with_channels(&[(1, 2, 0), (2, 1, 0), (3, 5, period)]);
        fixture.timestamp = Timestamp(period + 1);

        let mut ctx = fixture.context();
        process_download_channels(&mut ctx).unwrap();
        drop(ctx);

        assert_eq!(queue_bytes(&mut fixture), vec![3, 1]);
        let first = fixture.state.download_channels.find(&channel_id(1)).unwrap();
        assert_eq!(first.download_approval_count_left, 1);
        assert!(!first.download_approval_initiation_event.is_zero());
        assert_eq!(first.last_download_approval_initiated, Timestamp(period + 1));
    }

    #[test]
    fn tick_requeues_channels_with_rounds_left() {
        let period = StorageConfig::default().download_billing_period_ms();
        let mut fixture = fixture_with_channels(&[(1, 2, 0), (2, 2, 0), (3, 5, period)]);
        fixture.timestamp = Timestamp(period + 1);

        let mut ctx = fixture.context();
        process_download_channels(&mut ctx).unwrap();
        drop(ctx);

        assert_eq!(queue_bytes(&mut fixture), vec![3, 1, 2]);
    }

    #[test]
    fn new_channel_is_served_by_closest_replicators() {
        let mut fixture = Fixture::with_config(StorageConfig {
            shard_size: 20,
            ..StorageConfig::default()
        });
        let members: Vec<u8> = (1..=123).collect();
        for n in &members {
            fixture.replicator(*n, 0, false);
        }
        fixture.drive_with(250, 251, 10, &members);
        let (xpx, sm) = (fixture.xpx(), fixture.sm());
        fixture.credit(&key(252), xpx, 1_000);

        let id = Hash256::digest(b"channel");
        let notification = DownloadNotification {
            id,
            drive_key: key(250),
            consumer: key(252),
            download_size: 300,
            feedback_fee_amount: Amount(7),
            whitelisted_public_keys: vec![],
        };
        let mut ctx = fixture.context();
        open_download_channel(&mut ctx, &notification).unwrap();
        drop(ctx);

        let drive = fixture.state.drives.find(&key(250)).unwrap();
        let expected = closest_replicators(&drive.replicators, &id, 20);
        let channel = fixture.state.download_channels.find(&id).unwrap();
        assert_eq!(channel.shard_replicators, expected);
        assert_eq!(channel.cumulative_payments.len(), 20);
        assert!(drive.download_shards.contains(&id));
        assert_eq!(fixture.balance(&Key::from(id), sm), 300);
        assert_eq!(fixture.balance(&Key::from(id), xpx), 7);
        assert_eq!(fixture.balance(&key(252), xpx), 693);
        assert_eq!(channel_payment_queue(&mut fixture.state).len(), 1);
    }

    #[test]
    fn approval_pays_upper_median_minus_paid() {
        let mut fixture = Fixture::new();
        fixture.drive_with(100, 200, 10, &[]);
        let id = channel_id(9);
        let mut channel = DownloadChannelEntry::new(id, key(201), key(100), 100);
        channel.cumulative_payments.insert(key(1), Amount(5));
        channel.cumulative_payments.insert(key(2), Amount(0));
        fixture.state.download_channels.insert(id, channel);
        let (xpx, sm) = (fixture.xpx(), fixture.sm());
        fixture.credit(&Key::from(id), sm, 100);

        // Three judges over keys 1 and 2; the third judge has no opinion on key 2.
        let opinions = OpinionMatrix {
            public_keys: vec![key(3), key(1), key(2)],
            judging_keys_count: 1,
            overlapping_keys_count: 2,
            judged_keys_count: 0,
            present_opinions: pack_bits(&[true, true, true, true, true, false]),
            opinions: vec![10, 20, 12, 30, 14],
        };
        let notification = DownloadApprovalNotification {
            download_channel_id: id,
            approval_trigger: Hash256::ZERO,
            opinions,
        };
        let mut ctx = fixture.context();
        download_approval(&mut ctx, &notification).unwrap();
        drop(ctx);

        // Key 1: [10, 12, 14] -> 12, minus 5 paid. Key 2: [20, 30] -> 30.
        assert_eq!(fixture.balance(&key(1), xpx), 7);
        assert_eq!(fixture.balance(&key(2), xpx), 30);
        let channel = fixture.state.download_channels.find(&id).unwrap();
        assert_eq!(channel.cumulative_payments[&key(1)], Amount(12));
        assert_eq!(channel.cumulative_payments[&key(2)], Amount(30));
    }

    #[test]
    fn approval_scales_payments_to_balance() {
        let medians = [(key(1), 60, 0), (key(2), 40, 0), (key(3), 10, 20)];
        let payments = download_approval_payments(&medians, 50);
        assert_eq!(payments, vec![(key(1), 30), (key(2), 20), (key(3), 0)]);

        let payments = download_approval_payments(&medians, 1_000);
        assert_eq!(payments, vec![(key(1), 60), (key(2), 40), (key(3), 0)]);
    }

    #[test]
    fn approval_hands_out_rounding_remainder() {
        let medians = [(key(1), 1, 0), (key(2), 1, 0), (key(3), 1, 0)];
        let payments = download_approval_payments(&medians, 2);
        assert_eq!(payments, vec![(key(1), 1), (key(2), 1), (key(3), 0)]);

        let medians = [(key(1), 10, 0), (key(2), 0, 0), (key(3), 5, 0)];
        let payments = download_approval_payments(&medians, 7);
        assert_eq!(payments, vec![(key(1), 5), (key(2), 0), (key(3), 2)]);
    }

    proptest! {
        #[test]
        fn scaled_payments_never_exceed_balance(
            requests in proptest::collection::vec((0u64..1_000_000, 0u64..1_000), 0..12),
            balance in 0u64..2_000_000,
        ) {
            let medians: Vec<(Key, u64, u64)> = requests
                .iter()
                .enumerate()
                .map(|(n, (median, paid))| (key(n as u8), *median, *paid))
                .collect();
            let payments = download_approval_payments(&medians, balance);
            let total: u64 = medians.iter().map(|(_, median, paid)| median.saturating_sub(*paid)).sum();
            let paid: u64 = payments.iter().map(|(_, payment)| payment).sum();

            prop_assert!(paid <= balance);
            prop_assert_eq!(paid, total.min(balance));
            for ((_, median, already), (_, payment)) in medians.iter().zip(&payments) {
                prop_assert!(*payment <= median.saturating_sub(*already));
            }
        }
    }

    #[test]
    fn approval_for_a_stale_round_pays_nothing() {
        let mut fixture = Fixture::new();
        fixture.drive_with(100, 200, 10, &[]);
        let id = channel_id(9);
        let mut channel = DownloadChannelEntry::new(id, key(201), key(100), 100);
        channel.download_approval_initiation_event = Hash256::digest(b"current");
        channel.cumulative_payments.insert(key(1), Amount(0));
        fixture.state.download_channels.insert(id, channel);
        let (xpx, sm) = (fixture.xpx(), fixture.sm());
        fixture.credit(&Key::from(id), sm, 100);

        let opinions = OpinionMatrix {
            public_keys: vec![key(2), key(1)],
            judging_keys_count: 1,
            overlapping_keys_count: 0,
            judged_keys_count: 1,
            present_opinions: pack_bits(&[true]),
            opinions: vec![40],
        };
        let notification = DownloadApprovalNotification {
            download_channel_id: id,
            approval_trigger: Hash256::digest(b"previous"),
            opinions,
        };
        let mut ctx = fixture.context();
        download_approval(&mut ctx, &notification).unwrap();
        assert!(ctx.receipts.is_empty());
        drop(ctx);

        assert_eq!(fixture.balance(&key(1), xpx), 0);
        assert_eq!(fixture.balance(&Key::from(id), sm), 100);
        let channel = fixture.state.download_channels.find(&id).unwrap();
        assert_eq!(channel.cumulative_payments[&key(1)], Amount(0));
    }

    #[test]
    fn refund_returns_balances_and_removes_channel() {
        let mut fixture = Fixture::new();
        fixture.replicator(1, 0, false);
        fixture.drive_with(100, 200, 10, &[1]);
        let (xpx, sm) = (fixture.xpx(), fixture.sm());
        fixture.credit(&key(201), xpx, 50);
        let id = channel_id(4);
        let notification = DownloadNotification {
            id,
            drive_key: key(100),
            consumer: key(201),
            download_size: 20,
            feedback_fee_amount: Amount(3),
            whitelisted_public_keys: vec![key(202)],
        };
        let mut ctx = fixture.context();
        open_download_channel(&mut ctx, &notification).unwrap();
        download_channel_refund(&mut ctx, &DownloadChannelRefundNotification { download_channel_id: id }).unwrap();
        drop(ctx);

        assert_eq!(fixture.balance(&key(201), xpx), 50);
        assert_eq!(fixture.balance(&Key::from(id), sm), 0);
        assert!(!fixture.state.download_channels.contains(&id));
        assert!(!fixture.state.drives.find(&key(100)).unwrap().download_shards.contains(&id));
        assert!(fixture.state.replicators.find(&key(1)).unwrap().download_channels.is_empty());
        assert!(channel_payment_queue(&mut fixture.state).is_empty());
    }
}

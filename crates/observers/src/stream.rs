//! Streaming uploads, queued as data modifications of unknown final size.

use crate::context::ObserverContext;
use crate::error::{ObserverError, Result};
use crate::modification::modification_prepayment;
use crate::notifications::{StreamFinishNotification, StreamPaymentNotification, StreamStartNotification};
use drivenet_storage::EntityStore;
use drivenet_types::{ActiveDataModification, Amount, Key, StorageReceiptKind};
use tracing::debug;

pub fn start_stream(ctx: &mut ObserverContext<'_>, notification: &StreamStartNotification) -> Result<()> {
    let drive_key = notification.drive_key;
    let prepayment = {
        let drive = ctx
            .state
            .drives
            .find_mut(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;
        let mut stream = ActiveDataModification::stream(
            notification.stream_id,
            notification.owner,
            notification.expected_upload_size,
            notification.folder_name.clone(),
        );
        stream.prepaid_streaming_units =
            modification_prepayment(notification.expected_upload_size, drive.replicators.len());
        let prepayment = stream.prepaid_streaming_units;
        drive.active_data_modifications.push(stream);
        prepayment
    };
    let streaming = ctx.streaming_mosaic();
    ctx.pay_in(
        StorageReceiptKind::DataModificationPayment,
        &notification.owner,
        &drive_key,
        streaming,
        Amount(prepayment),
    )?;
    debug!(drive = %drive_key, stream = %notification.stream_id, "Stream started");
    Ok(())
}

/// Raise the expected size of a running stream; the owner prepays the difference.
pub fn stream_payment(ctx: &mut ObserverContext<'_>, notification: &StreamPaymentNotification) -> Result<()> {
    let drive_key = notification.drive_key;
    let id = notification.stream_id;
    let (owner, prepayment): (Key, u64) = {
        let drive = ctx
            .state
            .drives
            .find_mut(&drive_key)
            .ok_or(ObserverError::DriveNotFound(drive_key))?;
        let prepayment =
            modification_prepayment(notification.additional_upload_size, drive.replicators.len());
        let stream = drive
            .active_data_modifications
            .iter_mut()
            .find(|active| active.id == id && active.is_stream)
            .ok_or(ObserverError::ModificationNotFound { drive: drive_key, id })?;
        stream.expected_upload_size_mb = stream
            .expected_upload_size_mb
            .saturating_add(notification.additional_upload_size);
        stream.prepaid_streaming_units = stream.prepaid_streaming_units.saturating_add(prepayment);
        (stream.owner, prepayment)
    };
    let streaming = ctx.streaming_mosaic();
    ctx.pay_in(
        StorageReceiptKind::DataModificationPayment,
        &owner,
        &drive_key,
        streaming,
        Amount(prepayment),
    )
}

pub fn finish_stream(ctx: &mut ObserverContext<'_>, notification: &StreamFinishNotification) -> Result<()> {
    let drive_key = notification.drive_key;
    let id = notification.stream_id;
    let drive = ctx
        .state
        .drives
        .find_mut(&drive_key)
        .ok_or(ObserverError::DriveNotFound(drive_key))?;
    let stream = drive
        .active_data_modifications
        .iter_mut()
        .find(|active| active.id == id && active.is_stream)
        .ok_or(ObserverError::ModificationNotFound { drive: drive_key, id })?;
    stream.actual_upload_size_mb = notification.actual_upload_size;
    stream.download_data_cdi = notification.stream_structure_cdi;
    stream.ready_for_approval = true;
    debug!(drive = %drive_key, stream = %id, size = notification.actual_upload_size, "Stream finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{key, Fixture};
    use drivenet_types::Hash256;

    #[test]
    fn stream_lifecycle_prepays_and_becomes_ready() {
        let mut fixture = Fixture::new();
        for n in 1..=2 {
            fixture.replicator(n, 0, false);
        }
        fixture.drive_with(100, 200, 50, &[1, 2]);
        let (xpx, sm) = (fixture.xpx(), fixture.sm());
        fixture.credit(&key(200), xpx, 100);
        let id = Hash256::from_low_byte(5);

        let mut ctx = fixture.context();
        start_stream(
            &mut ctx,
            &StreamStartNotification {
                stream_id: id,
                drive_key: key(100),
                owner: key(200),
                expected_upload_size: 3,
                folder_name: "camera".to_string(),
            },
        )
        .unwrap();
        stream_payment(
            &mut ctx,
            &StreamPaymentNotification {
                drive_key: key(100),
                stream_id: id,
                additional_upload_size: 2,
            },
        )
        .unwrap();
        {
            let stream = &ctx.state.drives.find(&key(100)).unwrap().active_data_modifications[0];
            assert!(!stream.ready_for_approval);
            assert_eq!(stream.expected_upload_size_mb, 5);
            assert_eq!(stream.prepaid_streaming_units, 20);
        }
        finish_stream(
            &mut ctx,
            &StreamFinishNotification {
                drive_key: key(100),
                stream_id: id,
                actual_upload_size: 4,
                stream_structure_cdi: Hash256::digest(b"cdi"),
            },
        )
        .unwrap();
        drop(ctx);

        assert_eq!(fixture.balance(&key(200), xpx), 80);
        assert_eq!(fixture.balance(&key(100), sm), 20);
        let stream = &fixture.state.drives.find(&key(100)).unwrap().active_data_modifications[0];
        assert!(stream.ready_for_approval);
        assert_eq!(stream.actual_upload_size_mb, 4);
        assert_eq!(stream.folder_name, "camera");
    }

    #[test]
    fn payment_for_unknown_stream_fails() {
        let mut fixture = Fixture::new();
        fixture.drive_with(100, 200, 50, &[]);
        let mut ctx = fixture.context();
        let err = stream_payment(
            &mut ctx,
            &StreamPaymentNotification {
                drive_key: key(100),
                stream_id: Hash256::from_low_byte(1),
                additional_upload_size: 2,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ObserverError::ModificationNotFound { .. }));
    }
}

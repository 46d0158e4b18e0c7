use crate::{Amount, Key, MosaicId};
use serde::{Deserialize, Serialize};

/// Reason a balance transfer was made by the storage state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageReceiptKind {
    DrivePrepayment,
    ReplicatorDeposit,
    DriveDeposit,
    DriveDepositRefund,
    StoragePayment,
    DownloadWorkPayment,
    UploadWorkPayment,
    DataModificationPayment,
    DownloadChannelPayment,
    DownloadChannelRefund,
    FeedbackFee,
    DataModificationRefund,
    OwnerRefund,
    VerificationSlashing,
}

/// Balance transfer record emitted alongside state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageReceipt {
    pub kind: StorageReceiptKind,
    pub sender: Key,
    pub recipient: Key,
    pub mosaic: MosaicId,
    pub amount: Amount,
}

impl StorageReceipt {
    pub fn new(
        kind: StorageReceiptKind,
        sender: Key,
        recipient: Key,
        mosaic: MosaicId,
        amount: Amount,
    ) -> Self {
        Self {
            kind,
            sender,
            recipient,
            mosaic,
            amount,
        }
    }
}

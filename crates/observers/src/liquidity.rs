//! Exchange between service units (storage, streaming) and the network currency.

use crate::error::Result;
use drivenet_storage::AccountLedger;
use drivenet_types::{Amount, Key, MosaicId};

/// Converts service mosaics to and from the currency mosaic.
pub trait LiquidityProvider {
    /// Take `amount` of `service_mosaic` from `from` and pay its currency value to `to`.
    fn debit_mosaics(
        &self,
        ledger: &mut dyn AccountLedger,
        from: &Key,
        to: &Key,
        service_mosaic: MosaicId,
        amount: Amount,
    ) -> Result<()>;

    /// Charge `from` in currency and credit `amount` of `service_mosaic` to `to`.
    fn credit_mosaics(
        &self,
        ledger: &mut dyn AccountLedger,
        from: &Key,
        to: &Key,
        service_mosaic: MosaicId,
        amount: Amount,
    ) -> Result<()>;
}

/// One-to-one exchange against the currency mosaic.
#[derive(Debug, Clone, Copy)]
pub struct DirectExchange {
    currency: MosaicId,
}

impl DirectExchange {
    pub fn new(currency: MosaicId) -> Self {
        Self { currency }
    }
}

impl LiquidityProvider for DirectExchange {
    fn debit_mosaics(
        &self,
        ledger: &mut dyn AccountLedger,
        from: &Key,
        to: &Key,
        service_mosaic: MosaicId,
        amount: Amount,
    ) -> Result<()> {
        ledger.debit(from, service_mosaic, amount)?;
        ledger.credit(to, self.currency, amount)?;
        Ok(())
    }

    fn credit_mosaics(
        &self,
        ledger: &mut dyn AccountLedger,
        from: &Key,
        to: &Key,
        service_mosaic: MosaicId,
        amount: Amount,
    ) -> Result<()> {
        ledger.debit(from, self.currency, amount)?;
        ledger.credit(to, service_mosaic, amount)?;
        Ok(())
    }
}

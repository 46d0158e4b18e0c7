//! Account balance ledger used for deposits, payments and refunds.
//!
//! Balances are tracked per account and per mosaic. The storage state machine
//! never mints: every credit is paired with a debit of the same amount.

use crate::{Result, StorageError};
use drivenet_types::{Amount, Key, MosaicId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Interface for balance operations.
pub trait AccountLedger {
    /// Balance of `account` in `mosaic`; zero when unknown.
    fn balance(&self, account: &Key, mosaic: MosaicId) -> Amount;

    /// Credit `amount`, failing without side effects when the balance would overflow.
    fn credit(&mut self, account: &Key, mosaic: MosaicId, amount: Amount) -> Result<()>;

    /// Debit `amount`, failing without side effects when the balance is short.
    fn debit(&mut self, account: &Key, mosaic: MosaicId, amount: Amount) -> Result<()>;

    /// Sum of all balances of `mosaic`.
    fn total_supply(&self, mosaic: MosaicId) -> Amount;

    fn transfer(&mut self, from: &Key, to: &Key, mosaic: MosaicId, amount: Amount) -> Result<()> {
        let target = self.balance(to, mosaic);
        if from != to && target.checked_add(amount).is_none() {
            return Err(StorageError::BalanceOverflow {
                account: *to,
                mosaic,
                balance: target,
                amount,
            });
        }
        self.debit(from, mosaic, amount)?;
        self.credit(to, mosaic, amount)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryAccountLedger {
    balances: BTreeMap<Key, BTreeMap<MosaicId, Amount>>,
}

impl InMemoryAccountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All non-empty accounts and their balances.
    pub fn accounts(&self) -> impl Iterator<Item = (&Key, &BTreeMap<MosaicId, Amount>)> {
        self.balances.iter()
    }
}

impl AccountLedger for InMemoryAccountLedger {
    fn balance(&self, account: &Key, mosaic: MosaicId) -> Amount {
        self.balances
            .get(account)
            .and_then(|mosaics| mosaics.get(&mosaic))
            .copied()
            .unwrap_or_default()
    }

    fn credit(&mut self, account: &Key, mosaic: MosaicId, amount: Amount) -> Result<()> {
        if amount.0 == 0 {
            return Ok(());
        }
        let balance = self.balance(account, mosaic);
        let updated = balance
            .checked_add(amount)
            .ok_or(StorageError::BalanceOverflow {
                account: *account,
                mosaic,
                balance,
                amount,
            })?;
        self.balances
            .entry(*account)
            .or_default()
            .insert(mosaic, updated);
        Ok(())
    }

    fn debit(&mut self, account: &Key, mosaic: MosaicId, amount: Amount) -> Result<()> {
        if amount.0 == 0 {
            return Ok(());
        }
        let balance = self.balance(account, mosaic);
        let remaining = balance
            .checked_sub(amount)
            .ok_or(StorageError::InsufficientBalance {
                account: *account,
                mosaic,
                balance,
                amount,
            })?;

        let mosaics = self.balances.entry(*account).or_default();
        if remaining.0 == 0 {
            mosaics.remove(&mosaic);
        } else {
            mosaics.insert(mosaic, remaining);
        }
        if mosaics.is_empty() {
            self.balances.remove(account);
        }
        Ok(())
    }

    fn total_supply(&self, mosaic: MosaicId) -> Amount {
        self.balances
            .values()
            .filter_map(|mosaics| mosaics.get(&mosaic))
            .fold(Amount::default(), |acc, amount| acc.saturating_add(*amount))
    }
}

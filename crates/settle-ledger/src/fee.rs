use crate::error::{LedgerError, Result};
use crate::types::{Amount, FeeKind};
use serde::{Deserialize, Serialize};

pub const BPS_DENOMINATOR: u64 = 10_000;

/// Hard cap for any configured fee rate (10%).
pub const MAX_FEE_BPS: u16 = 1_000;

/// `floor(amount * rate_bps / 10_000)`.
///
/// Rounding always favours the payer, so fees can never create value.
pub fn compute_fee(amount: Amount, rate_bps: u16) -> Amount {
    let fee = (amount.units() as u128 * rate_bps as u128) / BPS_DENOMINATOR as u128;
    // only rates above 100% can leave the u64 range
    Amount::from_units(u64::try_from(fee).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    transfer_fee_bps: u16,
    withdrawal_fee_bps: u16,
}

impl FeeConfig {
    pub fn new(transfer_fee_bps: u16, withdrawal_fee_bps: u16) -> Result<Self> {
        let mut config = Self::default();
        config.set(FeeKind::Transfer, transfer_fee_bps)?;
        config.set(FeeKind::Withdrawal, withdrawal_fee_bps)?;
        Ok(config)
    }

    pub fn rate(&self, kind: FeeKind) -> u16 {
        match kind {
            FeeKind::Transfer => self.transfer_fee_bps,
            FeeKind::Withdrawal => self.withdrawal_fee_bps,
        }
    }

    /// Updates one rate and returns the previous one. The cap is enforced
    /// here, at configuration time, never when a fee is charged.
    pub fn set(&mut self, kind: FeeKind, bps: u16) -> Result<u16> {
        if bps > MAX_FEE_BPS {
            return Err(LedgerError::FeeRateExceedsMaximum {
                requested: bps,
                max: MAX_FEE_BPS,
            });
        }
        let slot = match kind {
            FeeKind::Transfer => &mut self.transfer_fee_bps,
            FeeKind::Withdrawal => &mut self.withdrawal_fee_bps,
        };
        Ok(std::mem::replace(slot, bps))
    }

    pub fn fee_for(&self, kind: FeeKind, amount: Amount) -> Amount {
        compute_fee(amount, self.rate(kind))
    }
}

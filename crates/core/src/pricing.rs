//! Canonical price function: subtotal → tax → fee → total.
//!
//! Staged snapshots carry a breakdown computed at placement time, but the
//! permanent store only ever records a breakdown recomputed here.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::money::Money;

/// Tax and fee settings applied to an order subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePolicy {
    /// Tax rate in basis points (800 = 8%).
    pub tax_rate_bps: u32,
    /// Flat service fee added after tax.
    pub service_fee: Money,
}

impl Default for PricePolicy {
    fn default() -> Self {
        Self {
            tax_rate_bps: 800,
            service_fee: Money::ZERO,
        }
    }
}

/// Result of pricing an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: Money,
    pub tax: Money,
    pub fee: Money,
    pub total: Money,
}

impl PricePolicy {
    /// Price a subtotal. Tax is rounded half-up to the cent.
    ///
    /// Fails if the tax or the total does not fit in [`Money`].
    pub fn quote(&self, subtotal: Money) -> Result<PriceBreakdown, DomainError> {
        let raw = i128::from(subtotal.cents()) * i128::from(self.tax_rate_bps);
        let tax_cents = if raw >= 0 {
            (raw + 5_000) / 10_000
        } else {
            (raw - 5_000) / 10_000
        };
        let overflow = || DomainError::validation(format!("price of subtotal {subtotal} overflows"));
        let tax = i64::try_from(tax_cents)
            .map(Money::from_cents)
            .map_err(|_| overflow())?;
        let total = subtotal
            .checked_add(tax)
            .and_then(|m| m.checked_add(self.service_fee))
            .ok_or_else(overflow)?;

        Ok(PriceBreakdown {
            subtotal,
            tax,
            fee: self.service_fee,
            total,
        })
    }
}

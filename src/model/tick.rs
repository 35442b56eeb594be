//! Tick — one quote/trade message from the upstream feed (spec §3).

use super::instrument::InstrumentKey;
use serde::{Deserialize, Serialize};

/// Fixed-point scale: prices are stored as integers representing the
/// quoted value times `PRICE_SCALE`, giving exactly 4 fractional digits
/// without pulling in a decimal crate the teacher never depended on.
pub const PRICE_SCALE: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_key: InstrumentKey,
    /// Millisecond UTC epoch timestamp.
    pub timestamp_ms: i64,
    /// Fixed-point, scaled by [`PRICE_SCALE`].
    pub last_traded_price: i64,
    pub last_traded_quantity: u64,
    pub cumulative_volume: u64,
    pub open_interest: u64,
}

impl Tick {
    pub fn price_decimal(&self) -> f64 {
        self.last_traded_price as f64 / PRICE_SCALE as f64
    }

    /// Rejects a tick that violates spec invariants: non-positive price.
    /// Negative quantity cannot be represented by the `u64` fields, so
    /// that half of `REJECTED_INVALID` is enforced by the type itself.
    pub fn validate(&self) -> Result<(), String> {
        if self.last_traded_price <= 0 {
            return Err(format!(
                "non-positive last_traded_price: {}",
                self.last_traded_price
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::instrument::InstrumentKey;

    fn ik() -> InstrumentKey {
        InstrumentKey::Equity { symbol: "TEST".into() }
    }

    #[test]
    fn rejects_non_positive_price() {
        let t = Tick {
            instrument_key: ik(),
            timestamp_ms: 0,
            last_traded_price: 0,
            last_traded_quantity: 1,
            cumulative_volume: 1,
            open_interest: 0,
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn price_decimal_has_four_fractional_digits() {
        let t = Tick {
            instrument_key: ik(),
            timestamp_ms: 0,
            last_traded_price: 150_0000,
            last_traded_quantity: 100,
            cumulative_volume: 100,
            open_interest: 0,
        };
        assert_eq!(t.price_decimal(), 150.0);
    }
}

use rust_decimal::Decimal;

use crate::config::FeeConfig;
use crate::domain::round_money;

/// Deterministic fee schedule: flat commission plus basis points on notional
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    flat: Decimal,
    bps: Decimal,
}

impl FeeSchedule {
    pub fn new(flat: Decimal, bps: Decimal) -> Self {
        Self { flat, bps }
    }

    pub fn from_config(config: &FeeConfig) -> Self {
        Self::new(config.flat, config.bps)
    }

    /// Fee for a fill of `qty` at `price`, rounded to cents
    pub fn fee_for(&self, qty: Decimal, price: Decimal) -> Decimal {
        let notional = qty * price;
        round_money(self.flat + notional * self.bps / Decimal::from(10_000))
    }

    pub fn free() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_flat_fee() {
        let fees = FeeSchedule::new(dec!(0.99), Decimal::ZERO);
        assert_eq!(fees.fee_for(dec!(2), dec!(175.43)), dec!(0.99));
    }

    #[test]
    fn test_bps_fee() {
        // 10 bps on 10_000 notional = 10.00
        let fees = FeeSchedule::new(Decimal::ZERO, dec!(10));
        assert_eq!(fees.fee_for(dec!(100), dec!(100)), dec!(10.00));
    }

    #[test]
    fn test_fee_is_deterministic() {
        let fees = FeeSchedule::new(dec!(0.50), dec!(5));
        let a = fees.fee_for(dec!(3), dec!(99.99));
        let b = fees.fee_for(dec!(3), dec!(99.99));
        assert_eq!(a, b);
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cash account — one per user (optionally per currency).
///
/// Mutated only by the ledger store's atomic apply. Committed states always
/// satisfy `balance >= 0` and `0 <= pending <= balance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashAccount {
    pub id: Uuid,
    pub currency: String,
    pub balance: Decimal,
    /// Funds reserved by in-flight withdrawals and working buy orders
    pub pending: Decimal,
    /// Bumped on every committed mutation
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl CashAccount {
    pub fn new(id: Uuid, currency: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            currency: currency.into(),
            balance: Decimal::ZERO,
            pending: Decimal::ZERO,
            version: 0,
            updated_at: now,
        }
    }

    /// Cash not claimed by any reservation
    pub fn available(&self) -> Decimal {
        self.balance - self.pending
    }
}

/// Position — an (account, symbol) pair.
///
/// `quantity >= 0` always (no shorting); `avg_cost` is meaningless at zero
/// quantity and the entry is removed when quantity returns to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: Uuid,
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    /// Quantity reserved by working sell orders
    pub reserved: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(account_id: Uuid, symbol: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            reserved: Decimal::ZERO,
            updated_at: now,
        }
    }

    /// Quantity not claimed by any sell reservation
    pub fn available(&self) -> Decimal {
        self.quantity - self.reserved
    }

    /// Recompute average cost for a buy fill.
    ///
    /// `new_avg = (old_qty*old_avg + fill_qty*fill_price) / (old_qty+fill_qty)`
    pub fn blended_avg_cost(&self, fill_qty: Decimal, fill_price: Decimal) -> Decimal {
        let total_qty = self.quantity + fill_qty;
        if total_qty.is_zero() {
            return Decimal::ZERO;
        }
        (self.quantity * self.avg_cost + fill_qty * fill_price) / total_qty
    }

    pub fn notional_value(&self) -> Decimal {
        self.quantity * self.avg_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_available_cash() {
        let mut account = CashAccount::new(Uuid::new_v4(), "USD", Utc::now());
        account.balance = dec!(1000);
        account.pending = dec!(300);
        assert_eq!(account.available(), dec!(700));
    }

    #[test]
    fn test_blended_avg_cost() {
        let mut position = Position::new(Uuid::new_v4(), "AAPL", Utc::now());
        position.quantity = dec!(2);
        position.avg_cost = dec!(100);

        // (2*100 + 2*200) / 4 = 150
        assert_eq!(position.blended_avg_cost(dec!(2), dec!(200)), dec!(150));
    }

    #[test]
    fn test_blended_avg_cost_from_flat() {
        let position = Position::new(Uuid::new_v4(), "AAPL", Utc::now());
        assert_eq!(position.blended_avg_cost(dec!(2), dec!(175.43)), dec!(175.43));
    }
}

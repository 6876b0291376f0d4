pub mod account;
pub mod algo;
pub mod order;
pub mod schedule;
pub mod transfer;

pub use account::{CashAccount, Position};
pub use algo::{AlgoOrder, AlgoStatus};
pub use order::{
    Fill, Order, OrderRequest, OrderSide, OrderStatus, OrderType, TimeInForce,
};
pub use schedule::{CalendarPolicy, CopySubscription, Frequency, RecurringSchedule};
pub use transfer::{
    DestinationStatus, FundTransaction, TransferDirection, TransferStatus, WithdrawalDestination,
};

use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;

/// Decimal places carried for quantities (fractional shares)
pub const QTY_DP: u32 = 8;

/// Decimal places carried for cash amounts
pub const MONEY_DP: u32 = 2;

/// Truncate a quantity to the quantity step (never rounds up)
pub fn round_qty(qty: Decimal) -> Decimal {
    qty.round_dp_with_strategy(QTY_DP, RoundingStrategy::ToZero)
}

/// Round a cash amount to cents (banker's rounding)
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp(MONEY_DP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_qty_truncates() {
        assert_eq!(round_qty(dec!(20.833333339)), dec!(20.83333333));
        assert_eq!(round_qty(dec!(2)), dec!(2));
    }

    #[test]
    fn round_money_to_cents() {
        assert_eq!(round_money(dec!(350.855)), dec!(350.86));
        assert_eq!(round_money(dec!(0.99)), dec!(0.99));
    }
}

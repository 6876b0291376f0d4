pub mod copy_trade;
pub mod recurring;

pub use copy_trade::{CopyTradePropagator, PropagationReport};
pub use recurring::{RecurringBuyScheduler, RecurringRunReport};

pub mod store;

pub use store::{AccountSnapshot, LedgerApply, LedgerReceipt, LedgerStore, PositionDelta};

pub mod service;

pub use service::{FundTransferService, SettlementGateway, SettlementResult};

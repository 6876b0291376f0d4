pub mod adapters;
pub mod algo;
pub mod cli;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod oracle;
pub mod schedulers;
pub mod services;
pub mod transfers;

pub use algo::{slice_plan, TwapSlicer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use engine::{ExecutionEngine, FeeSchedule, OrderStateMachine};
pub use error::{EngineError, Result};
pub use ledger::{AccountSnapshot, LedgerApply, LedgerReceipt, LedgerStore, PositionDelta};
pub use notify::{EngineEvent, LogNotifier, NotificationSink, WebhookNotifier};
pub use oracle::{FixedOracle, OracleGateway, PriceOracle, PriceQuote};
pub use schedulers::{CopyTradePropagator, RecurringBuyScheduler};
pub use services::{
    EvaluatorConfig, HealthServer, HealthState, Metrics, MetricsSnapshot, OrderEvaluator,
};
pub use transfers::{FundTransferService, SettlementGateway, SettlementResult};

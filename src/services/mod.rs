pub mod evaluator;
pub mod health;
pub mod metrics;

pub use evaluator::{EvaluatorConfig, EvaluatorStats, OrderEvaluator};
pub use health::{HealthServer, HealthState};
pub use metrics::{inc, Metrics, MetricsSnapshot};

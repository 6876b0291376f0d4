//! Order evaluation background service.
//!
//! The execution engine does not poll; this service does. Each sweep:
//! - expires GTD orders whose deadline has passed
//! - re-invokes the execution engine for every working trigger order
//! - drops idempotency entries older than the retention window

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::engine::{ExecutionEngine, OrderStateMachine};
use crate::error::{EngineError, Result};

/// Configuration for the order evaluator
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Interval between sweeps (milliseconds)
    pub interval_ms: u64,
    /// Idempotency key retention window (seconds)
    pub idempotency_window_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            idempotency_window_secs: 86_400,
        }
    }
}

/// Evaluator statistics
#[derive(Debug, Clone, Default)]
pub struct EvaluatorStats {
    pub sweeps: u64,
    pub orders_checked: u64,
    pub orders_executed: u64,
    pub orders_expired: u64,
    pub transient_failures: u64,
    pub last_sweep: Option<DateTime<Utc>>,
}

/// Periodic evaluator for working orders
pub struct OrderEvaluator {
    orders: Arc<OrderStateMachine>,
    engine: Arc<ExecutionEngine>,
    clock: Arc<dyn Clock>,
    config: EvaluatorConfig,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<EvaluatorStats>>,
}

impl OrderEvaluator {
    pub fn new(
        orders: Arc<OrderStateMachine>,
        engine: Arc<ExecutionEngine>,
        clock: Arc<dyn Clock>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            orders,
            engine,
            clock,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(EvaluatorStats::default())),
        }
    }

    pub async fn get_stats(&self) -> EvaluatorStats {
        self.stats.read().await.clone()
    }

    /// Start the sweep loop
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Order evaluator already running");
            return;
        }

        info!(
            interval_ms = self.config.interval_ms,
            "Starting order evaluator"
        );

        let evaluator = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
                evaluator.config.interval_ms,
            ));

            while evaluator.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) = evaluator.run_sweep().await {
                    error!("Evaluator sweep failed: {}", e);
                }
            }

            info!("Order evaluator stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Order evaluator stop requested");
    }

    /// Run a single sweep over every working order
    pub async fn run_sweep(&self) -> Result<()> {
        let now = self.clock.now();
        let working = self.orders.working_orders().await;

        let mut checked = 0u64;
        let mut executed = 0u64;
        let mut expired = 0u64;
        let mut transient = 0u64;

        for order in working {
            checked += 1;

            if order.is_expired_at(now) {
                match self.orders.expire(order.id).await {
                    Ok(_) => {
                        expired += 1;
                        debug!(order_id = %order.id, "Expired past-deadline order");
                    }
                    Err(EngineError::InvalidTransition { .. }) => {}
                    Err(e) => warn!(order_id = %order.id, "Expiry failed: {}", e),
                }
                continue;
            }

            match self.engine.try_execute(order.id).await {
                Ok(Some(_)) => executed += 1,
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    transient += 1;
                    debug!(order_id = %order.id, "Transient execution failure: {}", e);
                }
                // A cancel won the race between snapshot and execution
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => warn!(order_id = %order.id, "Execution failed: {}", e),
            }
        }

        let swept = self
            .orders
            .sweep_idempotency(ChronoDuration::seconds(
                self.config.idempotency_window_secs as i64,
            ));
        if swept > 0 {
            debug!(swept, "Dropped stale idempotency entries");
        }

        let mut stats = self.stats.write().await;
        stats.sweeps += 1;
        stats.orders_checked += checked;
        stats.orders_executed += executed;
        stats.orders_expired += expired;
        stats.transient_failures += transient;
        stats.last_sweep = Some(now);

        debug!(
            checked,
            executed, expired, transient, "Evaluator sweep complete"
        );
        Ok(())
    }
}

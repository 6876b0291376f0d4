//! Recurring buy scheduler.
//!
//! Owns its schedule state explicitly and reads time through the injected
//! clock. Each run selects schedules whose `next_execution_date` has
//! arrived, submits a market buy per schedule, and advances the date only
//! when submission succeeded — a failed submission leaves the date alone so
//! the next run retries instead of silently skipping.

use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::PostgresStore;
use crate::clock::Clock;
use crate::domain::{round_qty, CalendarPolicy, OrderRequest, OrderSide, RecurringSchedule};
use crate::engine::{ExecutionEngine, OrderStateMachine};
use crate::error::{EngineError, Result};
use crate::oracle::OracleGateway;
use crate::services::{inc, Metrics};

/// Outcome of one scheduler run
#[derive(Debug, Default)]
pub struct RecurringRunReport {
    pub executed: usize,
    pub failed: usize,
    /// (schedule id, reason) per schedule left for retry
    pub failures: Vec<(Uuid, String)>,
}

pub struct RecurringBuyScheduler {
    orders: Arc<OrderStateMachine>,
    engine: Arc<ExecutionEngine>,
    oracle: Arc<OracleGateway>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<PostgresStore>>,
    metrics: Arc<Metrics>,
    policy: CalendarPolicy,
    schedules: DashMap<Uuid, RecurringSchedule>,
}

impl RecurringBuyScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<OrderStateMachine>,
        engine: Arc<ExecutionEngine>,
        oracle: Arc<OracleGateway>,
        clock: Arc<dyn Clock>,
        store: Option<Arc<PostgresStore>>,
        metrics: Arc<Metrics>,
        policy: CalendarPolicy,
    ) -> Self {
        Self {
            orders,
            engine,
            oracle,
            clock,
            store,
            metrics,
            policy,
            schedules: DashMap::new(),
        }
    }

    pub fn register_schedule(&self, schedule: RecurringSchedule) -> Result<()> {
        if schedule.amount <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "schedule amount must be positive".to_string(),
            ));
        }
        self.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    pub fn deactivate_schedule(&self, schedule_id: Uuid) {
        if let Some(mut entry) = self.schedules.get_mut(&schedule_id) {
            entry.active = false;
        }
    }

    pub fn get_schedule(&self, schedule_id: Uuid) -> Option<RecurringSchedule> {
        self.schedules
            .get(&schedule_id)
            .map(|entry| entry.value().clone())
    }

    /// Execute every schedule due on or before `today`.
    pub async fn run_due(&self, today: NaiveDate) -> RecurringRunReport {
        let due: Vec<RecurringSchedule> = self
            .schedules
            .iter()
            .filter(|entry| entry.is_due(today))
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = RecurringRunReport::default();
        if due.is_empty() {
            return report;
        }

        info!(count = due.len(), %today, "Running due recurring buys");

        for schedule in due {
            match self.execute_schedule(&schedule, today).await {
                Ok(()) => report.executed += 1,
                Err(e) => {
                    // Date untouched: the schedule retries on the next run
                    warn!(
                        schedule_id = %schedule.id,
                        account_id = %schedule.account_id,
                        "Recurring buy failed, will retry: {}",
                        e
                    );
                    report.failed += 1;
                    report.failures.push((schedule.id, e.to_string()));
                }
            }
        }

        report
    }

    async fn execute_schedule(&self, schedule: &RecurringSchedule, today: NaiveDate) -> Result<()> {
        let quote = self.oracle.get_last_price(&schedule.symbol).await?;
        let qty = round_qty(schedule.amount / quote.price);
        if qty.is_zero() {
            return Err(EngineError::Validation(format!(
                "amount {} buys zero quantity at price {}",
                schedule.amount, quote.price
            )));
        }

        // Key derived from the occurrence date: a crashed run that already
        // submitted resolves to the same order on retry.
        let request = OrderRequest::market(
            schedule.account_id,
            schedule.symbol.clone(),
            OrderSide::Buy,
            qty,
            format!("recur-{}-{}", schedule.id, schedule.next_execution_date),
        );
        let order = self.orders.submit(request).await?;
        inc(&self.metrics.recurring_orders_submitted);

        if let Err(e) = self.engine.try_execute(order.id).await {
            // Submission succeeded; a transient execution failure is the
            // evaluator's to retry and must not hold the date back
            warn!(order_id = %order.id, "Recurring order left working: {}", e);
        }

        // Advance past today, skipping any backlog of missed occurrences
        let mut next = schedule.next_execution_date;
        while next <= today {
            next = self.policy.next_date(next, schedule.frequency);
        }

        if let Some(mut entry) = self.schedules.get_mut(&schedule.id) {
            entry.next_execution_date = next;
            let snapshot = entry.value().clone();
            drop(entry);
            self.persist(&snapshot).await;
        }

        info!(
            schedule_id = %schedule.id,
            order_id = %order.id,
            next = %next,
            "Recurring buy dispatched"
        );
        Ok(())
    }

    /// Periodic driver: one `run_due` per interval until stopped externally.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let today = self.clock.now().date_naive();
            let report = self.run_due(today).await;
            if report.executed > 0 || report.failed > 0 {
                info!(
                    executed = report.executed,
                    failed = report.failed,
                    "Recurring sweep complete"
                );
            }
        }
    }

    async fn persist(&self, schedule: &RecurringSchedule) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_schedule(schedule).await {
                warn!(schedule_id = %schedule.id, "Failed to persist schedule: {}", e);
            }
        }
    }
}

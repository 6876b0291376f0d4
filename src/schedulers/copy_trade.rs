//! Copy-trade propagator.
//!
//! Fans a trader's fill out to every active subscription as a market order
//! for the subscriber. A per-subscriber failure (typically insufficient
//! funds) is recorded and never blocks the rest of the fan-out.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{round_qty, CopySubscription, Fill, OrderRequest};
use crate::engine::{ExecutionEngine, OrderStateMachine};
use crate::error::{EngineError, Result};
use crate::services::{inc, Metrics};

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct PropagationReport {
    /// Child order ids submitted for subscribers
    pub submitted: Vec<Uuid>,
    /// (subscription id, reason) per subscriber that could not follow
    pub failures: Vec<(Uuid, String)>,
}

pub struct CopyTradePropagator {
    orders: Arc<OrderStateMachine>,
    engine: Arc<ExecutionEngine>,
    metrics: Arc<Metrics>,
    subscriptions: DashMap<Uuid, CopySubscription>,
}

impl CopyTradePropagator {
    pub fn new(
        orders: Arc<OrderStateMachine>,
        engine: Arc<ExecutionEngine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            orders,
            engine,
            metrics,
            subscriptions: DashMap::new(),
        }
    }

    pub fn register_subscription(&self, subscription: CopySubscription) -> Result<()> {
        if subscription.subscriber_account == subscription.trader_account {
            return Err(EngineError::Validation(
                "subscriber and trader must differ".to_string(),
            ));
        }
        if subscription.copy_amount <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "copy_amount must be positive".to_string(),
            ));
        }
        self.subscriptions
            .insert(subscription.id, subscription);
        Ok(())
    }

    pub fn deactivate_subscription(&self, subscription_id: Uuid) {
        if let Some(mut entry) = self.subscriptions.get_mut(&subscription_id) {
            entry.active = false;
        }
    }

    fn subscriptions_for(&self, trader_account: Uuid) -> Vec<CopySubscription> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.active && entry.trader_account == trader_account)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Fan a trader fill out to all active subscriptions.
    ///
    /// `copy_qty = copy_amount / fill_price`; the child order carries an
    /// idempotency key derived from (subscription, fill), so replaying the
    /// same fill event cannot double-copy.
    pub async fn on_fill(&self, fill: &Fill) -> PropagationReport {
        let subscriptions = self.subscriptions_for(fill.account_id);
        let mut report = PropagationReport::default();

        if subscriptions.is_empty() {
            return report;
        }

        debug!(
            trader = %fill.account_id,
            followers = subscriptions.len(),
            "Propagating fill"
        );

        for subscription in subscriptions {
            let copy_qty = round_qty(subscription.copy_amount / fill.price);
            if copy_qty.is_zero() {
                report.failures.push((
                    subscription.id,
                    format!(
                        "copy_amount {} too small at price {}",
                        subscription.copy_amount, fill.price
                    ),
                ));
                continue;
            }

            let request = OrderRequest::market(
                subscription.subscriber_account,
                fill.symbol.clone(),
                fill.side,
                copy_qty,
                format!("copy-{}-{}", subscription.id, fill.id),
            );

            let order = match self.orders.submit(request).await {
                Ok(order) => order,
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.id,
                        subscriber = %subscription.subscriber_account,
                        "Copy order rejected: {}",
                        e
                    );
                    report.failures.push((subscription.id, e.to_string()));
                    continue;
                }
            };

            inc(&self.metrics.copy_orders_submitted);
            report.submitted.push(order.id);

            if let Err(e) = self.engine.try_execute(order.id).await {
                // Order stays working; the evaluator retries transient cases
                warn!(order_id = %order.id, "Copy order execution failed: {}", e);
                report.failures.push((subscription.id, e.to_string()));
            }
        }

        info!(
            trader = %fill.account_id,
            submitted = report.submitted.len(),
            failures = report.failures.len(),
            "Fan-out complete"
        );
        report
    }

    /// Consume the execution engine's fill stream until it closes.
    pub async fn run(self: Arc<Self>) {
        let mut fills = self.engine.subscribe_fills();
        loop {
            match fills.recv().await {
                Ok(fill) => {
                    // Copies of copies are legitimate chains; self-loops are
                    // impossible because subscriber != trader is enforced.
                    self.on_fill(&fill).await;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Copy propagator lagged behind fill stream");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Copy propagator stopped");
    }
}

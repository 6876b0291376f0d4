//! Execution engine.
//!
//! Turns working orders into fills against the price oracle. The price is
//! fetched before any lock; the order's write lock and the account's ledger
//! mutex are held only for the trigger-check-and-commit step. A fill that
//! the ledger refuses is retried once against refreshed state and then
//! surfaced, leaving the order working — never silently dropped.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::PostgresStore;
use crate::clock::Clock;
use crate::domain::{Fill, Order, OrderSide, OrderStatus, OrderType};
use crate::error::{EngineError, Result};
use crate::ledger::{LedgerApply, LedgerStore, PositionDelta};
use crate::notify::{dispatch, EngineEvent, NotificationSink};
use crate::oracle::OracleGateway;
use crate::services::{inc, Metrics};

use super::fees::FeeSchedule;
use super::orders::OrderStateMachine;

const FILL_EVENT_CAPACITY: usize = 256;

pub struct ExecutionEngine {
    orders: Arc<OrderStateMachine>,
    ledger: Arc<LedgerStore>,
    oracle: Arc<OracleGateway>,
    fees: FeeSchedule,
    clock: Arc<dyn Clock>,
    store: Option<Arc<PostgresStore>>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
    fills: DashMap<Uuid, Vec<Fill>>,
    fill_events: broadcast::Sender<Fill>,
    /// Per-invocation liquidity cap; `None` fills the full remainder
    fill_cap: Option<Decimal>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<OrderStateMachine>,
        ledger: Arc<LedgerStore>,
        oracle: Arc<OracleGateway>,
        fees: FeeSchedule,
        clock: Arc<dyn Clock>,
        store: Option<Arc<PostgresStore>>,
        notifier: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (fill_events, _) = broadcast::channel(FILL_EVENT_CAPACITY);
        Self {
            orders,
            ledger,
            oracle,
            fees,
            clock,
            store,
            notifier,
            metrics,
            fills: DashMap::new(),
            fill_events,
            fill_cap: None,
        }
    }

    /// Cap the quantity any single invocation may fill
    pub fn with_fill_cap(mut self, cap: Decimal) -> Self {
        self.fill_cap = Some(cap);
        self
    }

    /// Stream of committed fills for downstream propagators
    pub fn subscribe_fills(&self) -> broadcast::Receiver<Fill> {
        self.fill_events.subscribe()
    }

    /// Fills recorded for an order, in application order
    pub fn fills_for(&self, order_id: Uuid) -> Vec<Fill> {
        self.fills
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Attempt to execute a working order against the current price.
    ///
    /// Returns `Ok(None)` when the trigger condition is not met. Transient
    /// oracle failures surface as `PriceUnavailable` with the order left
    /// working for retry.
    pub async fn try_execute(&self, order_id: Uuid) -> Result<Option<Fill>> {
        let handle = self.orders.handle(order_id)?;

        let (symbol, status) = {
            let guard = handle.read().await;
            (guard.symbol.clone(), guard.status)
        };
        if !status.is_active() {
            return Err(EngineError::InvalidTransition {
                order_id: order_id.to_string(),
                status: status.to_string(),
            });
        }

        // Price first: a stalled oracle must not hold any lock
        let quote = self.oracle.get_last_price(&symbol).await?;

        let mut guard = handle.write().await;
        // A cancel may have won the race while we fetched the price
        if !guard.status.is_active() {
            return Err(EngineError::InvalidTransition {
                order_id: order_id.to_string(),
                status: guard.status.to_string(),
            });
        }

        if !Self::evaluate_trigger(&mut guard, quote.price) {
            let snapshot = guard.clone();
            drop(guard);
            self.orders.persist_update(&snapshot).await;
            return Ok(None);
        }

        let remaining = guard.remaining_qty();
        let qty = match self.fill_cap {
            Some(cap) => remaining.min(cap),
            None => remaining,
        };
        let price = quote.price;
        let fee = self.fees.fee_for(qty, price);

        let apply = match guard.side {
            OrderSide::Buy => LedgerApply::for_account(guard.account_id)
                .cash(-(qty * price + fee))
                .release(qty * guard.reserve_price)
                .fee(fee)
                .position(PositionDelta::fill(guard.symbol.clone(), qty, price)),
            OrderSide::Sell => LedgerApply::for_account(guard.account_id)
                .cash(qty * price - fee)
                .fee(fee)
                .position(PositionDelta {
                    symbol: guard.symbol.clone(),
                    qty_delta: -qty,
                    fill_price: Some(price),
                    release_qty: qty,
                    ..Default::default()
                }),
        };

        let receipt = match self.ledger.apply(apply.clone()).await {
            Ok(receipt) => receipt,
            Err(first) => {
                warn!(
                    order_id = %order_id,
                    "Ledger apply failed, retrying against refreshed state: {}",
                    first
                );
                match self.ledger.apply(apply).await {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        // Order stays working; the failure goes to the caller
                        return Err(e);
                    }
                }
            }
        };

        let now = self.clock.now();
        let status = guard.record_fill(qty, now);
        let fill = Fill {
            id: Uuid::new_v4(),
            order_id,
            account_id: guard.account_id,
            symbol: guard.symbol.clone(),
            side: guard.side,
            qty,
            price,
            fee,
            realized_pnl: receipt.realized_pnl,
            executed_at: now,
        };
        let order_snapshot = guard.clone();
        drop(guard);

        self.fills.entry(order_id).or_default().push(fill.clone());
        inc(&self.metrics.fills_recorded);
        info!(
            order_id = %order_id,
            qty = %qty,
            price = %price,
            fee = %fee,
            status = %status,
            "Fill committed"
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_trade(&fill).await {
                warn!(order_id = %order_id, "Failed to persist trade: {}", e);
            }
        }
        self.orders.persist_update(&order_snapshot).await;

        // Best-effort downstream fan-out; a lagging subscriber is its own problem
        let _ = self.fill_events.send(fill.clone());

        if status == OrderStatus::Filled {
            dispatch(
                &self.notifier,
                EngineEvent::OrderFilled {
                    account_id: order_snapshot.account_id,
                    order_id,
                    symbol: order_snapshot.symbol.clone(),
                    qty: order_snapshot.filled_qty,
                    price,
                },
            );
        }

        // One leg of an OCO pair executing cancels the sibling's remainder
        if let Some(sibling) = order_snapshot.oco_sibling_id {
            self.orders.cancel_remainder(sibling).await?;
        }

        Ok(Some(fill))
    }

    /// Evaluate the order's trigger against the current price, mutating
    /// stop-arming and trailing watermarks as a side effect.
    fn evaluate_trigger(order: &mut Order, price: Decimal) -> bool {
        match order.order_type {
            OrderType::Market => true,

            OrderType::Limit => {
                let Some(limit) = order.limit_price else {
                    return false;
                };
                match order.side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                }
            }

            OrderType::Stop => {
                Self::arm_stop(order, price);
                order.stop_armed
            }

            OrderType::StopLimit => {
                Self::arm_stop(order, price);
                if !order.stop_armed {
                    return false;
                }
                let Some(limit) = order.limit_price else {
                    return false;
                };
                match order.side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                }
            }

            OrderType::TrailingStop => {
                let Some(trail) = order.trail_amount else {
                    return false;
                };
                let watermark = match (order.trail_watermark, order.side) {
                    (None, _) => price,
                    // Sells trail the highest price seen, buys the lowest
                    (Some(mark), OrderSide::Sell) => mark.max(price),
                    (Some(mark), OrderSide::Buy) => mark.min(price),
                };
                order.trail_watermark = Some(watermark);

                if !order.stop_armed {
                    let crossed = match order.side {
                        OrderSide::Sell => price <= watermark - trail,
                        OrderSide::Buy => price >= watermark + trail,
                    };
                    if crossed {
                        order.stop_armed = true;
                        debug!(order_id = %order.id, price = %price, "Trailing stop armed");
                    }
                }
                order.stop_armed
            }
        }
    }

    fn arm_stop(order: &mut Order, price: Decimal) {
        if order.stop_armed {
            return;
        }
        let Some(stop) = order.stop_price else {
            return;
        };
        let crossed = match order.side {
            OrderSide::Buy => price >= stop,
            OrderSide::Sell => price <= stop,
        };
        if crossed {
            order.stop_armed = true;
            debug!(order_id = %order.id, price = %price, "Stop armed");
        }
    }
}

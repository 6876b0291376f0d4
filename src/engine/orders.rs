//! Order state machine.
//!
//! Owns every order's lifecycle: validation, idempotent submission with
//! buying-power reservation, cancel/expire with reservation release, and
//! OCO pair linkage. Fills are applied by the execution engine through the
//! handles this store hands out.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::PostgresStore;
use crate::clock::Clock;
use crate::domain::{Order, OrderRequest, OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::error::{EngineError, Result};
use crate::ledger::{LedgerApply, LedgerStore, PositionDelta};
use crate::notify::{dispatch, EngineEvent, NotificationSink};
use crate::oracle::OracleGateway;
use crate::services::{inc, Metrics};

#[derive(Debug, Clone)]
struct IdempotencyEntry {
    order_id: Uuid,
    inserted_at: DateTime<Utc>,
}

/// Order lifecycle owner
pub struct OrderStateMachine {
    orders: DashMap<Uuid, Arc<RwLock<Order>>>,
    idempotency: DashMap<(Uuid, String), IdempotencyEntry>,
    ledger: Arc<LedgerStore>,
    oracle: Arc<OracleGateway>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<PostgresStore>>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
}

impl OrderStateMachine {
    pub fn new(
        ledger: Arc<LedgerStore>,
        oracle: Arc<OracleGateway>,
        clock: Arc<dyn Clock>,
        store: Option<Arc<PostgresStore>>,
        notifier: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            orders: DashMap::new(),
            idempotency: DashMap::new(),
            ledger,
            oracle,
            clock,
            store,
            notifier,
            metrics,
        }
    }

    /// Submit an order: validate, dedupe, reserve, persist.
    ///
    /// A replay with the same `(account, idempotency_key)` returns the
    /// original order and never creates a duplicate or double-executes.
    pub async fn submit(&self, request: OrderRequest) -> Result<Order> {
        self.submit_with_parent(request, None).await
    }

    /// Submit a child order on behalf of an algo parent
    pub async fn submit_with_parent(
        &self,
        request: OrderRequest,
        parent_algo_id: Option<Uuid>,
    ) -> Result<Order> {
        self.validate_request(&request)?;

        let key = (request.account_id, request.idempotency_key.clone());
        if let Some(entry) = self.idempotency.get(&key) {
            debug!(order_id = %entry.order_id, "Idempotent replay, returning original order");
            return self.get_order(entry.order_id).await;
        }

        // One oracle read supplies the reservation estimate for market-side
        // buys; taken before any account lock.
        let reserve_price = self.reserve_price(&request).await?;

        let now = self.clock.now();
        let mut order = Order::from_request(&request, reserve_price, now);
        order.parent_algo_id = parent_algo_id;
        let order_id = order.id;

        let handle = Arc::new(RwLock::new(order.clone()));
        self.orders.insert(order_id, handle.clone());

        // Claim the idempotency slot before reserving so a concurrent
        // replay maps to this submission instead of racing a second one.
        match self.idempotency.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().order_id;
                self.orders.remove(&order_id);
                return self.get_order(existing).await;
            }
            Entry::Vacant(slot) => {
                slot.insert(IdempotencyEntry {
                    order_id,
                    inserted_at: now,
                });
            }
        }

        if let Err(e) = self.reserve(&order).await {
            // Rejected before persistence: drop the claim so a later
            // attempt re-validates from scratch.
            self.orders.remove(&order_id);
            self.idempotency.remove(&key);

            if e.is_rejection() {
                inc(&self.metrics.orders_rejected);
                info!(order_id = %order_id, "Order rejected: {}", e);
                dispatch(
                    &self.notifier,
                    EngineEvent::OrderRejected {
                        account_id: request.account_id,
                        reason: e.to_string(),
                    },
                );
                self.record_rejection(&order, &e).await;
            }
            return Err(e);
        }

        {
            let mut guard = handle.write().await;
            guard.status = OrderStatus::Working;
            guard.updated_at = now;
            order = guard.clone();
        }

        inc(&self.metrics.orders_submitted);
        info!(
            order_id = %order_id,
            account_id = %order.account_id,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            qty = %order.requested_qty,
            "Order accepted"
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_order(&order).await {
                warn!(order_id = %order_id, "Failed to persist order: {}", e);
            }
        }

        Ok(order)
    }

    /// Submit a linked one-cancels-other pair.
    ///
    /// Both reservations must succeed; a failure on the second leg unwinds
    /// the first before returning.
    pub async fn submit_oco(
        &self,
        first: OrderRequest,
        second: OrderRequest,
    ) -> Result<(Order, Order)> {
        if first.account_id != second.account_id {
            return Err(EngineError::Validation(
                "OCO legs must belong to one account".to_string(),
            ));
        }

        let first_order = self.submit(first).await?;
        let second_order = match self.submit(second).await {
            Ok(order) => order,
            Err(e) => {
                let _ = self.close_single(first_order.id, OrderStatus::Cancelled).await;
                return Err(e);
            }
        };

        self.link_siblings(first_order.id, second_order.id).await?;

        let first_order = self.get_order(first_order.id).await?;
        let second_order = self.get_order(second_order.id).await?;
        Ok((first_order, second_order))
    }

    async fn link_siblings(&self, a: Uuid, b: Uuid) -> Result<()> {
        {
            let handle = self.handle(a)?;
            let mut guard = handle.write().await;
            guard.oco_sibling_id = Some(b);
        }
        {
            let handle = self.handle(b)?;
            let mut guard = handle.write().await;
            guard.oco_sibling_id = Some(a);
        }
        Ok(())
    }

    /// Cancel a working order, releasing the unfilled remainder's
    /// reservation. Cancelling one OCO leg cancels its sibling.
    pub async fn cancel(&self, order_id: Uuid) -> Result<Order> {
        let order = self.close_single(order_id, OrderStatus::Cancelled).await?;
        inc(&self.metrics.orders_cancelled);

        if let Some(sibling) = order.oco_sibling_id {
            match self.close_single(sibling, OrderStatus::Cancelled).await {
                Ok(_) => debug!(order_id = %sibling, "Cancelled OCO sibling"),
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(order)
    }

    /// Expire a working order whose time-in-force deadline has passed.
    /// Same effect as cancel on the unfilled remainder.
    pub async fn expire(&self, order_id: Uuid) -> Result<Order> {
        {
            let handle = self.handle(order_id)?;
            let guard = handle.read().await;
            if !guard.is_expired_at(self.clock.now()) {
                return Err(EngineError::Validation(format!(
                    "order {} has not reached its deadline",
                    order_id
                )));
            }
        }

        let order = self.close_single(order_id, OrderStatus::Expired).await?;
        inc(&self.metrics.orders_expired);

        if let Some(sibling) = order.oco_sibling_id {
            match self.close_single(sibling, OrderStatus::Cancelled).await {
                Ok(_) => {}
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(order)
    }

    /// Cancel the unfilled remainder of an OCO sibling after the other leg
    /// filled. Losing the race to a terminal state is not an error here.
    pub(crate) async fn cancel_remainder(&self, order_id: Uuid) -> Result<()> {
        match self.close_single(order_id, OrderStatus::Cancelled).await {
            Ok(_) => {
                inc(&self.metrics.orders_cancelled);
                Ok(())
            }
            Err(EngineError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close_single(&self, order_id: Uuid, target: OrderStatus) -> Result<Order> {
        let handle = self.handle(order_id)?;
        let mut guard = handle.write().await;

        if !guard.status.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                order_id: order_id.to_string(),
                status: guard.status.to_string(),
            });
        }

        let remaining = guard.remaining_qty();
        if remaining > Decimal::ZERO {
            let release = match guard.side {
                OrderSide::Buy => LedgerApply::for_account(guard.account_id)
                    .release(remaining * guard.reserve_price),
                OrderSide::Sell => LedgerApply::for_account(guard.account_id)
                    .position(PositionDelta::release(guard.symbol.clone(), remaining)),
            };
            self.ledger.apply(release).await?;
        }

        guard.status = target;
        guard.updated_at = self.clock.now();
        let snapshot = guard.clone();
        drop(guard);

        info!(order_id = %order_id, status = %snapshot.status, "Order closed");
        self.persist_update(&snapshot).await;
        Ok(snapshot)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order> {
        let handle = self.handle(order_id)?;
        let guard = handle.read().await;
        Ok(guard.clone())
    }

    pub(crate) fn handle(&self, order_id: Uuid) -> Result<Arc<RwLock<Order>>> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))
    }

    /// Snapshot of every order still eligible for execution
    pub async fn working_orders(&self) -> Vec<Order> {
        let handles: Vec<Arc<RwLock<Order>>> = self
            .orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut working = Vec::new();
        for handle in handles {
            let guard = handle.read().await;
            if guard.status.is_active() {
                working.push(guard.clone());
            }
        }
        working
    }

    /// Drop idempotency entries older than the retention window.
    /// Returns the number removed.
    pub fn sweep_idempotency(&self, window: Duration) -> usize {
        let cutoff = self.clock.now() - window;
        let before = self.idempotency.len();
        self.idempotency.retain(|_, entry| entry.inserted_at > cutoff);
        before - self.idempotency.len()
    }

    pub(crate) async fn persist_update(&self, order: &Order) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_order(order).await {
                warn!(order_id = %order.id, "Failed to persist order update: {}", e);
            }
        }
    }

    async fn record_rejection(&self, order: &Order, error: &EngineError) {
        if let Some(store) = &self.store {
            let mut rejected = order.clone();
            rejected.status = OrderStatus::Rejected;
            rejected.reject_reason = Some(error.to_string());
            if let Err(e) = store.insert_order(&rejected).await {
                warn!(order_id = %order.id, "Failed to persist rejection: {}", e);
            }
        }
    }

    fn validate_request(&self, request: &OrderRequest) -> Result<()> {
        if request.quantity <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "quantity must be positive".to_string(),
            ));
        }
        if request.idempotency_key.trim().is_empty() {
            return Err(EngineError::Validation(
                "idempotency_key must not be empty".to_string(),
            ));
        }
        if request.symbol.trim().is_empty() {
            return Err(EngineError::Validation("symbol must not be empty".to_string()));
        }

        if request.order_type.requires_limit_price() {
            match request.limit_price {
                Some(price) if price > Decimal::ZERO => {}
                _ => {
                    return Err(EngineError::Validation(format!(
                        "{} orders require a positive limit_price",
                        request.order_type
                    )))
                }
            }
        }
        if request.order_type.requires_stop_price() {
            match request.stop_price {
                Some(price) if price > Decimal::ZERO => {}
                _ => {
                    return Err(EngineError::Validation(format!(
                        "{} orders require a positive stop_price",
                        request.order_type
                    )))
                }
            }
        }
        if request.order_type == OrderType::TrailingStop {
            match request.trail_amount {
                Some(trail) if trail > Decimal::ZERO => {}
                _ => {
                    return Err(EngineError::Validation(
                        "trailing_stop orders require a positive trail_amount".to_string(),
                    ))
                }
            }
        }
        if matches!(request.time_in_force, TimeInForce::GTD) && request.expires_at.is_none() {
            return Err(EngineError::Validation(
                "GTD orders require expires_at".to_string(),
            ));
        }

        Ok(())
    }

    /// Unit price backing a buy reservation: the order's own price when it
    /// has one, otherwise one oracle read.
    async fn reserve_price(&self, request: &OrderRequest) -> Result<Decimal> {
        if request.side == OrderSide::Sell {
            return Ok(Decimal::ZERO);
        }
        if let Some(price) = request.limit_price.or(request.stop_price) {
            return Ok(price);
        }
        let quote = self.oracle.get_last_price(&request.symbol).await?;
        Ok(quote.price)
    }

    async fn reserve(&self, order: &Order) -> Result<()> {
        let apply = match order.side {
            OrderSide::Buy => LedgerApply::for_account(order.account_id)
                .reserve(order.requested_qty * order.reserve_price),
            OrderSide::Sell => LedgerApply::for_account(order.account_id).position(
                PositionDelta::reserve(order.symbol.clone(), order.requested_qty),
            ),
        };
        self.ledger.apply(apply).await?;
        Ok(())
    }
}

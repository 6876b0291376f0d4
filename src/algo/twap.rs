//! Time-weighted average price (TWAP) slicer.
//!
//! Decomposes a parent algo order into `ceil(duration / slice_interval)`
//! child market orders dispatched one per tick through the order state
//! machine and execution engine. Rounding remainder lands entirely in the
//! final slice; a slice that fails to fill carries its shortfall into the
//! next one, and a schedule that ends with quantity still unplaced marks
//! the parent `degraded` with the failure reason.

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::PostgresStore;
use crate::clock::Clock;
use crate::domain::{round_qty, AlgoOrder, AlgoStatus, Order, OrderRequest, OrderSide};
use crate::engine::{ExecutionEngine, OrderStateMachine};
use crate::error::{EngineError, Result};
use crate::services::{inc, Metrics};

/// Split `total_qty` into per-slice quantities.
///
/// Every slice except the last is `total_qty / n` truncated to the quantity
/// step; the last absorbs the remainder exactly, so the slice quantities
/// always sum to `total_qty`. A quantity too small to split collapses to a
/// single slice.
pub fn slice_plan(
    total_qty: Decimal,
    duration: ChronoDuration,
    slice_interval: ChronoDuration,
) -> Result<Vec<Decimal>> {
    if total_qty <= Decimal::ZERO {
        return Err(EngineError::Validation(
            "total_qty must be positive".to_string(),
        ));
    }
    let duration_secs = duration.num_seconds();
    let interval_secs = slice_interval.num_seconds();
    if duration_secs <= 0 || interval_secs <= 0 {
        return Err(EngineError::Validation(
            "duration and slice_interval must be positive".to_string(),
        ));
    }

    let n = (duration_secs + interval_secs - 1) / interval_secs;
    let n = n.max(1) as usize;

    let per_slice = round_qty(total_qty / Decimal::from(n as u64));
    if per_slice.is_zero() || n == 1 {
        return Ok(vec![total_qty]);
    }

    let mut slices = vec![per_slice; n];
    let scheduled: Decimal = per_slice * Decimal::from((n - 1) as u64);
    slices[n - 1] = total_qty - scheduled;
    Ok(slices)
}

struct AlgoState {
    algo: AlgoOrder,
    /// Slice quantities not yet dispatched
    schedule: Vec<Decimal>,
    /// Quantity from failed slices, added to the next dispatch
    carry: Decimal,
    /// Sequence number for child idempotency keys
    seq: u32,
    child_ids: Vec<Uuid>,
    last_error: Option<String>,
}

/// Algorithmic slicer — a client of the order state machine, not part of it
pub struct TwapSlicer {
    orders: Arc<OrderStateMachine>,
    engine: Arc<ExecutionEngine>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<PostgresStore>>,
    metrics: Arc<Metrics>,
    algos: DashMap<Uuid, Arc<RwLock<AlgoState>>>,
}

impl TwapSlicer {
    pub fn new(
        orders: Arc<OrderStateMachine>,
        engine: Arc<ExecutionEngine>,
        clock: Arc<dyn Clock>,
        store: Option<Arc<PostgresStore>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            orders,
            engine,
            clock,
            store,
            metrics,
            algos: DashMap::new(),
        }
    }

    /// Register a TWAP parent and compute its slice schedule
    pub async fn start(
        &self,
        account_id: Uuid,
        symbol: &str,
        side: OrderSide,
        total_qty: Decimal,
        duration: ChronoDuration,
        slice_interval: ChronoDuration,
    ) -> Result<AlgoOrder> {
        let schedule = slice_plan(total_qty, duration, slice_interval)?;
        let algo = AlgoOrder::new(
            account_id,
            symbol,
            side,
            total_qty,
            duration,
            slice_interval,
            self.clock.now(),
        );

        info!(
            algo_id = %algo.id,
            symbol = %algo.symbol,
            total_qty = %total_qty,
            slices = schedule.len(),
            "TWAP schedule created"
        );

        self.persist(&algo).await;
        let snapshot = algo.clone();
        self.algos.insert(
            algo.id,
            Arc::new(RwLock::new(AlgoState {
                algo,
                schedule,
                carry: Decimal::ZERO,
                seq: 0,
                child_ids: Vec::new(),
                last_error: None,
            })),
        );
        Ok(snapshot)
    }

    pub async fn get(&self, algo_id: Uuid) -> Result<AlgoOrder> {
        let handle = self.handle(algo_id)?;
        let guard = handle.read().await;
        Ok(guard.algo.clone())
    }

    pub async fn child_order_ids(&self, algo_id: Uuid) -> Result<Vec<Uuid>> {
        let handle = self.handle(algo_id)?;
        let guard = handle.read().await;
        Ok(guard.child_ids.clone())
    }

    /// Slices not yet dispatched
    pub async fn remaining_slices(&self, algo_id: Uuid) -> Result<usize> {
        let handle = self.handle(algo_id)?;
        let guard = handle.read().await;
        Ok(guard.schedule.len())
    }

    /// Stop dispatching further slices. Children already working are left
    /// to run; nothing is cancelled retroactively.
    pub async fn cancel(&self, algo_id: Uuid) -> Result<AlgoOrder> {
        let handle = self.handle(algo_id)?;
        let mut guard = handle.write().await;
        if guard.algo.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                order_id: algo_id.to_string(),
                status: guard.algo.status.to_string(),
            });
        }
        guard.algo.status = AlgoStatus::Cancelled;
        guard.algo.updated_at = self.clock.now();
        guard.schedule.clear();
        let snapshot = guard.algo.clone();
        drop(guard);

        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Dispatch one slice. Invoked by the runner at each interval, or
    /// directly by tests.
    ///
    /// Returns the child order when one was submitted, `None` once the
    /// schedule is finished or the parent is terminal.
    pub async fn tick(&self, algo_id: Uuid) -> Result<Option<Order>> {
        let handle = self.handle(algo_id)?;
        let mut guard = handle.write().await;

        if guard.algo.status.is_terminal() {
            return Ok(None);
        }

        let Some(slice_qty) = guard.schedule.first().copied() else {
            self.finalize(&mut guard).await;
            return Ok(None);
        };
        guard.schedule.remove(0);

        let qty = slice_qty + guard.carry;
        guard.carry = Decimal::ZERO;
        guard.seq += 1;
        let seq = guard.seq;

        let request = OrderRequest::market(
            guard.algo.account_id,
            guard.algo.symbol.clone(),
            guard.algo.side,
            qty,
            format!("algo-{}-slice-{}", algo_id, seq),
        );

        let child = match self
            .orders
            .submit_with_parent(request, Some(algo_id))
            .await
        {
            Ok(child) => child,
            Err(e) => {
                // Shortfall carried forward, never silently dropped
                warn!(algo_id = %algo_id, seq, "Slice submission failed: {}", e);
                guard.carry = qty;
                guard.last_error = Some(e.to_string());
                if guard.schedule.is_empty() {
                    self.finalize(&mut guard).await;
                }
                let snapshot = guard.algo.clone();
                drop(guard);
                self.persist(&snapshot).await;
                return Ok(None);
            }
        };

        guard.child_ids.push(child.id);
        inc(&self.metrics.slices_dispatched);

        match self.engine.try_execute(child.id).await {
            Ok(Some(fill)) => {
                guard.algo.filled_qty += fill.qty;
                guard.algo.updated_at = self.clock.now();
                debug!(
                    algo_id = %algo_id,
                    seq,
                    qty = %fill.qty,
                    filled = %guard.algo.filled_qty,
                    "Slice filled"
                );
            }
            Ok(None) => {
                // Market children either fill or error; nothing to do here
            }
            Err(e) => {
                warn!(algo_id = %algo_id, seq, "Slice execution failed: {}", e);
                // Release the child's reservation and carry the quantity
                let _ = self.orders.cancel(child.id).await;
                guard.carry = qty;
                guard.last_error = Some(e.to_string());
            }
        }

        if guard.schedule.is_empty() {
            self.finalize(&mut guard).await;
        }

        let snapshot = guard.algo.clone();
        drop(guard);
        self.persist(&snapshot).await;

        Ok(Some(child))
    }

    /// Drive the schedule to completion, one tick per slice interval.
    pub async fn run(&self, algo_id: Uuid) -> Result<AlgoOrder> {
        let interval = {
            let handle = self.handle(algo_id)?;
            let guard = handle.read().await;
            guard
                .algo
                .slice_interval
                .to_std()
                .map_err(|e| EngineError::Validation(format!("bad slice interval: {}", e)))?
        };

        loop {
            {
                let handle = self.handle(algo_id)?;
                let guard = handle.read().await;
                if guard.algo.status.is_terminal() {
                    return Ok(guard.algo.clone());
                }
            }
            self.tick(algo_id).await?;
            tokio::time::sleep(interval).await;
        }
    }

    async fn finalize(&self, state: &mut AlgoState) {
        if state.algo.status.is_terminal() {
            return;
        }

        state.algo.status = if state.carry > Decimal::ZERO
            || state.algo.filled_qty < state.algo.total_qty
        {
            state.algo.failure_reason = Some(
                state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "schedule ended with unfilled quantity".to_string()),
            );
            AlgoStatus::Degraded
        } else {
            AlgoStatus::Completed
        };
        state.algo.updated_at = self.clock.now();

        info!(
            algo_id = %state.algo.id,
            status = %state.algo.status,
            filled = %state.algo.filled_qty,
            total = %state.algo.total_qty,
            "TWAP schedule finished"
        );
    }

    async fn persist(&self, algo: &AlgoOrder) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_algo_order(algo).await {
                warn!(algo_id = %algo.id, "Failed to persist algo order: {}", e);
            }
        }
    }

    fn handle(&self, algo_id: Uuid) -> Result<Arc<RwLock<AlgoState>>> {
        self.algos
            .get(&algo_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::OrderNotFound(algo_id.to_string()))
    }
}

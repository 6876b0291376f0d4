use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    AlgoOrder, AlgoStatus, CashAccount, CopySubscription, DestinationStatus, Fill, FundTransaction,
    Frequency, Order, OrderSide, OrderStatus, OrderType, Position, RecurringSchedule,
    TimeInForce, TransferDirection, TransferStatus, WithdrawalDestination,
};
use crate::error::{EngineError, Result};
use crate::ledger::AccountSnapshot;

/// PostgreSQL record store.
///
/// Durable mirror of the data model; the in-memory engine state is
/// authoritative and writes through here after each commit.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==================== Accounts & positions ====================

    /// Persist a committed account snapshot (account row + full position set)
    #[instrument(skip(self, snapshot))]
    pub async fn save_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let account = &snapshot.account;

        sqlx::query(
            r#"
            INSERT INTO accounts (id, currency, balance, pending, version, realized_pnl, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                balance = EXCLUDED.balance,
                pending = EXCLUDED.pending,
                version = EXCLUDED.version,
                realized_pnl = EXCLUDED.realized_pnl,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(account.id)
        .bind(&account.currency)
        .bind(account.balance)
        .bind(account.pending)
        .bind(account.version as i64)
        .bind(snapshot.realized_pnl)
        .bind(account.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM positions WHERE account_id = $1")
            .bind(account.id)
            .execute(&mut *tx)
            .await?;

        for position in &snapshot.positions {
            sqlx::query(
                r#"
                INSERT INTO positions (account_id, symbol, quantity, avg_cost, reserved, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(position.account_id)
            .bind(&position.symbol)
            .bind(position.quantity)
            .bind(position.avg_cost)
            .bind(position.reserved)
            .bind(position.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(account_id = %account.id, "Saved account snapshot");
        Ok(())
    }

    /// Load every account with its positions (startup restore)
    pub async fn load_accounts(&self) -> Result<Vec<(CashAccount, Vec<Position>)>> {
        let account_rows = sqlx::query(
            "SELECT id, currency, balance, pending, version, updated_at FROM accounts",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut accounts = Vec::with_capacity(account_rows.len());
        for row in &account_rows {
            let account = CashAccount {
                id: row.get("id"),
                currency: row.get("currency"),
                balance: row.get("balance"),
                pending: row.get("pending"),
                version: row.get::<i64, _>("version") as u64,
                updated_at: row.get("updated_at"),
            };

            let position_rows = sqlx::query(
                r#"
                SELECT account_id, symbol, quantity, avg_cost, reserved, updated_at
                FROM positions WHERE account_id = $1
                "#,
            )
            .bind(account.id)
            .fetch_all(&self.pool)
            .await?;

            let positions = position_rows
                .iter()
                .map(|row| Position {
                    account_id: row.get("account_id"),
                    symbol: row.get("symbol"),
                    quantity: row.get("quantity"),
                    avg_cost: row.get("avg_cost"),
                    reserved: row.get("reserved"),
                    updated_at: row.get("updated_at"),
                })
                .collect();

            accounts.push((account, positions));
        }

        Ok(accounts)
    }

    // ==================== Orders ====================

    #[instrument(skip(self, order))]
    pub async fn insert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, account_id, symbol, side, order_type, requested_qty, filled_qty,
                limit_price, stop_price, trail_amount, stop_armed, trail_watermark,
                status, reserve_price, parent_algo_id, oco_sibling_id, idempotency_key,
                time_in_force, expires_at, reject_reason, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
            )
            "#,
        )
        .bind(order.id)
        .bind(order.account_id)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.requested_qty)
        .bind(order.filled_qty)
        .bind(order.limit_price)
        .bind(order.stop_price)
        .bind(order.trail_amount)
        .bind(order.stop_armed)
        .bind(order.trail_watermark)
        .bind(order.status.as_str())
        .bind(order.reserve_price)
        .bind(order.parent_algo_id)
        .bind(order.oco_sibling_id)
        .bind(&order.idempotency_key)
        .bind(time_in_force_str(order.time_in_force))
        .bind(order.expires_at)
        .bind(&order.reject_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, order))]
    pub async fn update_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders SET
                filled_qty = $2,
                stop_armed = $3,
                trail_watermark = $4,
                status = $5,
                oco_sibling_id = $6,
                reject_reason = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(order.filled_qty)
        .bind(order.stop_armed)
        .bind(order.trail_watermark)
        .bind(order.status.as_str())
        .bind(order.oco_sibling_id)
        .bind(&order.reject_reason)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, symbol, side, order_type, requested_qty, filled_qty,
                   limit_price, stop_price, trail_amount, stop_armed, trail_watermark,
                   status, reserve_price, parent_algo_id, oco_sibling_id, idempotency_key,
                   time_in_force, expires_at, reject_reason, created_at, updated_at
            FROM orders WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| order_from_row(&r)).transpose()
    }

    // ==================== Trades ====================

    #[instrument(skip(self, fill))]
    pub async fn insert_trade(&self, fill: &Fill) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, order_id, account_id, symbol, side, qty, price, fee, realized_pnl, executed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(fill.id)
        .bind(fill.order_id)
        .bind(fill.account_id)
        .bind(&fill.symbol)
        .bind(fill.side.as_str())
        .bind(fill.qty)
        .bind(fill.price)
        .bind(fill.fee)
        .bind(fill.realized_pnl)
        .bind(fill.executed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_trades_for_order(&self, order_id: Uuid) -> Result<Vec<Fill>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, account_id, symbol, side, qty, price, fee, realized_pnl, executed_at
            FROM trades
            WHERE order_id = $1
            ORDER BY executed_at ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(fill_from_row).collect()
    }

    // ==================== Fund transfers ====================

    #[instrument(skip(self, transfer))]
    pub async fn upsert_transfer(&self, transfer: &FundTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fund_transactions (
                id, account_id, direction, amount, external_destination_id, source,
                settlement_ref, status, failure_reason, idempotency_key, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                settlement_ref = EXCLUDED.settlement_ref,
                status = EXCLUDED.status,
                failure_reason = EXCLUDED.failure_reason,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(transfer.id)
        .bind(transfer.account_id)
        .bind(transfer.direction.as_str())
        .bind(transfer.amount)
        .bind(transfer.external_destination_id)
        .bind(&transfer.source)
        .bind(&transfer.settlement_ref)
        .bind(transfer.status.as_str())
        .bind(&transfer.failure_reason)
        .bind(&transfer.idempotency_key)
        .bind(transfer.created_at)
        .bind(transfer.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<FundTransaction>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, direction, amount, external_destination_id, source,
                   settlement_ref, status, failure_reason, idempotency_key, created_at, updated_at
            FROM fund_transactions WHERE id = $1
            "#,
        )
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| transfer_from_row(&r)).transpose()
    }

    // ==================== Withdrawal destinations ====================

    #[instrument(skip(self, destination))]
    pub async fn upsert_destination(&self, destination: &WithdrawalDestination) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO withdrawal_destinations (id, account_id, label, status, approved_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                label = EXCLUDED.label,
                status = EXCLUDED.status,
                approved_at = EXCLUDED.approved_at
            "#,
        )
        .bind(destination.id)
        .bind(destination.account_id)
        .bind(&destination.label)
        .bind(destination.status.as_str())
        .bind(destination.approved_at)
        .bind(destination.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_destinations(&self) -> Result<Vec<WithdrawalDestination>> {
        let rows = sqlx::query(
            "SELECT id, account_id, label, status, approved_at, created_at FROM withdrawal_destinations",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status_str: String = row.get("status");
                Ok(WithdrawalDestination {
                    id: row.get("id"),
                    account_id: row.get("account_id"),
                    label: row.get("label"),
                    status: destination_status_from(&status_str)?,
                    approved_at: row.get("approved_at"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    // ==================== Algo orders ====================

    #[instrument(skip(self, algo))]
    pub async fn upsert_algo_order(&self, algo: &AlgoOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO algo_orders (
                id, account_id, symbol, side, total_qty, filled_qty,
                slice_interval_secs, duration_secs, start_time, end_time,
                status, failure_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                filled_qty = EXCLUDED.filled_qty,
                status = EXCLUDED.status,
                failure_reason = EXCLUDED.failure_reason,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(algo.id)
        .bind(algo.account_id)
        .bind(&algo.symbol)
        .bind(algo.side.as_str())
        .bind(algo.total_qty)
        .bind(algo.filled_qty)
        .bind(algo.slice_interval.num_seconds())
        .bind(algo.duration.num_seconds())
        .bind(algo.start_time)
        .bind(algo.end_time)
        .bind(algo.status.as_str())
        .bind(&algo.failure_reason)
        .bind(algo.created_at)
        .bind(algo.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load algo orders still marked working (crash-recovery inspection)
    pub async fn load_working_algo_orders(&self) -> Result<Vec<AlgoOrder>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, symbol, side, total_qty, filled_qty,
                   slice_interval_secs, duration_secs, start_time, end_time,
                   status, failure_reason, created_at, updated_at
            FROM algo_orders
            WHERE status = 'working'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let side_str: String = row.get("side");
                let status_str: String = row.get("status");
                Ok(AlgoOrder {
                    id: row.get("id"),
                    account_id: row.get("account_id"),
                    symbol: row.get("symbol"),
                    side: OrderSide::try_from(side_str.as_str()).map_err(EngineError::Internal)?,
                    total_qty: row.get("total_qty"),
                    filled_qty: row.get("filled_qty"),
                    slice_interval: chrono::Duration::seconds(
                        row.get::<i64, _>("slice_interval_secs"),
                    ),
                    duration: chrono::Duration::seconds(row.get::<i64, _>("duration_secs")),
                    start_time: row.get("start_time"),
                    end_time: row.get("end_time"),
                    status: algo_status_from(&status_str)?,
                    failure_reason: row.get("failure_reason"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }

    // ==================== Recurring schedules ====================

    #[instrument(skip(self, schedule))]
    pub async fn upsert_schedule(&self, schedule: &RecurringSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recurring_schedules (id, account_id, symbol, amount, frequency, next_execution_date, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                amount = EXCLUDED.amount,
                frequency = EXCLUDED.frequency,
                next_execution_date = EXCLUDED.next_execution_date,
                active = EXCLUDED.active
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.account_id)
        .bind(&schedule.symbol)
        .bind(schedule.amount)
        .bind(schedule.frequency.as_str())
        .bind(schedule.next_execution_date)
        .bind(schedule.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_schedules(&self) -> Result<Vec<RecurringSchedule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, symbol, amount, frequency, next_execution_date, active
            FROM recurring_schedules
            WHERE active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let frequency_str: String = row.get("frequency");
                Ok(RecurringSchedule {
                    id: row.get("id"),
                    account_id: row.get("account_id"),
                    symbol: row.get("symbol"),
                    amount: row.get("amount"),
                    frequency: Frequency::try_from(frequency_str.as_str())
                        .map_err(EngineError::Internal)?,
                    next_execution_date: row.get::<NaiveDate, _>("next_execution_date"),
                    active: row.get("active"),
                })
            })
            .collect()
    }

    // ==================== Copy subscriptions ====================

    #[instrument(skip(self, subscription))]
    pub async fn upsert_subscription(&self, subscription: &CopySubscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO copy_subscriptions (id, subscriber_account, trader_account, copy_amount, active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                copy_amount = EXCLUDED.copy_amount,
                active = EXCLUDED.active
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.subscriber_account)
        .bind(subscription.trader_account)
        .bind(subscription.copy_amount)
        .bind(subscription.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_subscriptions(&self) -> Result<Vec<CopySubscription>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subscriber_account, trader_account, copy_amount, active
            FROM copy_subscriptions
            WHERE active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CopySubscription {
                id: row.get("id"),
                subscriber_account: row.get("subscriber_account"),
                trader_account: row.get("trader_account"),
                copy_amount: row.get::<Decimal, _>("copy_amount"),
                active: row.get("active"),
            })
            .collect())
    }
}

fn time_in_force_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GTC => "GTC",
        TimeInForce::GTD => "GTD",
    }
}

fn time_in_force_from(s: &str) -> Result<TimeInForce> {
    match s {
        "GTC" => Ok(TimeInForce::GTC),
        "GTD" => Ok(TimeInForce::GTD),
        other => Err(EngineError::Internal(format!(
            "unknown time_in_force: {}",
            other
        ))),
    }
}

fn destination_status_from(s: &str) -> Result<DestinationStatus> {
    match s {
        "pending_review" => Ok(DestinationStatus::PendingReview),
        "active" => Ok(DestinationStatus::Active),
        "disabled" => Ok(DestinationStatus::Disabled),
        other => Err(EngineError::Internal(format!(
            "unknown destination status: {}",
            other
        ))),
    }
}

fn algo_status_from(s: &str) -> Result<AlgoStatus> {
    match s {
        "working" => Ok(AlgoStatus::Working),
        "completed" => Ok(AlgoStatus::Completed),
        "degraded" => Ok(AlgoStatus::Degraded),
        "cancelled" => Ok(AlgoStatus::Cancelled),
        other => Err(EngineError::Internal(format!(
            "unknown algo status: {}",
            other
        ))),
    }
}

fn transfer_from_row(row: &PgRow) -> Result<FundTransaction> {
    let direction_str: String = row.get("direction");
    let status_str: String = row.get("status");

    let direction = match direction_str.as_str() {
        "deposit" => TransferDirection::Deposit,
        "withdrawal" => TransferDirection::Withdrawal,
        other => {
            return Err(EngineError::Internal(format!(
                "unknown transfer direction: {}",
                other
            )))
        }
    };
    let status = match status_str.as_str() {
        "pending" => TransferStatus::Pending,
        "completed" => TransferStatus::Completed,
        "failed" => TransferStatus::Failed,
        "cancelled" => TransferStatus::Cancelled,
        other => {
            return Err(EngineError::Internal(format!(
                "unknown transfer status: {}",
                other
            )))
        }
    };

    Ok(FundTransaction {
        id: row.get("id"),
        account_id: row.get("account_id"),
        direction,
        amount: row.get("amount"),
        external_destination_id: row.get("external_destination_id"),
        source: row.get("source"),
        settlement_ref: row.get("settlement_ref"),
        status,
        failure_reason: row.get("failure_reason"),
        idempotency_key: row.get("idempotency_key"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let side_str: String = row.get("side");
    let type_str: String = row.get("order_type");
    let status_str: String = row.get("status");
    let tif_str: String = row.get("time_in_force");

    let order_type = match type_str.as_str() {
        "market" => OrderType::Market,
        "limit" => OrderType::Limit,
        "stop" => OrderType::Stop,
        "stop_limit" => OrderType::StopLimit,
        "trailing_stop" => OrderType::TrailingStop,
        other => {
            return Err(EngineError::Internal(format!(
                "unknown order type: {}",
                other
            )))
        }
    };

    Ok(Order {
        id: row.get("id"),
        account_id: row.get("account_id"),
        symbol: row.get("symbol"),
        side: OrderSide::try_from(side_str.as_str()).map_err(EngineError::Internal)?,
        order_type,
        requested_qty: row.get("requested_qty"),
        filled_qty: row.get("filled_qty"),
        limit_price: row.get("limit_price"),
        stop_price: row.get("stop_price"),
        trail_amount: row.get("trail_amount"),
        stop_armed: row.get("stop_armed"),
        trail_watermark: row.get("trail_watermark"),
        status: OrderStatus::try_from(status_str.as_str()).map_err(EngineError::Internal)?,
        reserve_price: row.get("reserve_price"),
        parent_algo_id: row.get("parent_algo_id"),
        oco_sibling_id: row.get("oco_sibling_id"),
        idempotency_key: row.get("idempotency_key"),
        time_in_force: time_in_force_from(&tif_str)?,
        expires_at: row.get("expires_at"),
        reject_reason: row.get("reject_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn fill_from_row(row: &PgRow) -> Result<Fill> {
    let side_str: String = row.get("side");
    Ok(Fill {
        id: row.get("id"),
        order_id: row.get("order_id"),
        account_id: row.get("account_id"),
        symbol: row.get("symbol"),
        side: OrderSide::try_from(side_str.as_str()).map_err(EngineError::Internal)?,
        qty: row.get("qty"),
        price: row.get("price"),
        fee: row.get("fee"),
        realized_pnl: row.get("realized_pnl"),
        executed_at: row.get("executed_at"),
    })
}

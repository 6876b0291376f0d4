use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderSide {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            _ => Err(format!("Unknown side: {}", s)),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TrailingStop => "trailing_stop",
        }
    }

    /// Types that require a limit price at submission
    pub fn requires_limit_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }

    /// Types that require a stop price at submission
    pub fn requires_stop_price(&self) -> bool {
        matches!(self, OrderType::Stop | OrderType::StopLimit)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Good Till Date (deadline carried on the order)
    GTD,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Submitted, not yet validated/reserved
    PendingValidation,
    /// Live and eligible for execution
    Working,
    /// Some quantity filled, remainder still working
    PartiallyFilled,
    /// Fully filled
    Filled,
    /// Cancelled by the owner (or an OCO sibling)
    Cancelled,
    /// Rejected during validation or reservation
    Rejected,
    /// Time-in-force deadline passed
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingValidation => "pending_validation",
            OrderStatus::Working => "working",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Working | OrderStatus::PartiallyFilled)
    }

    /// Check if this status can transition to another status.
    ///
    /// Transitions are monotonic: terminal states accept nothing, and an
    /// order never regresses to validation.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, target) {
            // From PendingValidation
            (PendingValidation, Working) => true,
            (PendingValidation, Rejected) => true,

            // From Working
            (Working, PartiallyFilled) => true,
            (Working, Filled) => true,
            (Working, Cancelled) => true,
            (Working, Expired) => true,

            // From PartiallyFilled (re-enters Working between fills)
            (PartiallyFilled, Working) => true,
            (PartiallyFilled, Filled) => true,
            (PartiallyFilled, Cancelled) => true,
            (PartiallyFilled, Expired) => true,

            // All other transitions are invalid
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "pending_validation" => Ok(OrderStatus::PendingValidation),
            "working" => Ok(OrderStatus::Working),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "rejected" => Ok(OrderStatus::Rejected),
            "expired" => Ok(OrderStatus::Expired),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Order request (what the caller wants to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trail_amount: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
}

impl OrderRequest {
    pub fn market(
        account_id: Uuid,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
            trail_amount: None,
            time_in_force: TimeInForce::GTC,
            expires_at: None,
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn limit(
        account_id: Uuid,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(limit_price),
            stop_price: None,
            trail_amount: None,
            time_in_force: TimeInForce::GTC,
            expires_at: None,
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn stop(
        account_id: Uuid,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Stop,
            quantity,
            limit_price: None,
            stop_price: Some(stop_price),
            trail_amount: None,
            time_in_force: TimeInForce::GTC,
            expires_at: None,
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn expiring_at(mut self, deadline: DateTime<Utc>) -> Self {
        self.time_in_force = TimeInForce::GTD;
        self.expires_at = Some(deadline);
        self
    }
}

/// Order (tracked in the engine)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trail_amount: Option<Decimal>,
    /// Set once a stop/trailing-stop condition has been crossed
    pub stop_armed: bool,
    /// Best price observed since submission, for trailing-stop ratcheting
    pub trail_watermark: Option<Decimal>,
    pub status: OrderStatus,
    /// Unit price used when the buy-side cash reservation was taken
    pub reserve_price: Decimal,
    pub parent_algo_id: Option<Uuid>,
    pub oco_sibling_id: Option<Uuid>,
    pub idempotency_key: String,
    pub time_in_force: TimeInForce,
    pub expires_at: Option<DateTime<Utc>>,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_request(request: &OrderRequest, reserve_price: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: request.account_id,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            requested_qty: request.quantity,
            filled_qty: Decimal::ZERO,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            trail_amount: request.trail_amount,
            stop_armed: false,
            trail_watermark: None,
            status: OrderStatus::PendingValidation,
            reserve_price,
            parent_algo_id: None,
            oco_sibling_id: None,
            idempotency_key: request.idempotency_key.clone(),
            time_in_force: request.time_in_force,
            expires_at: request.expires_at,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Quantity still awaiting fills
    pub fn remaining_qty(&self) -> Decimal {
        self.requested_qty - self.filled_qty
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_qty >= self.requested_qty
    }

    /// Advance fill bookkeeping after a committed ledger apply.
    ///
    /// Returns the new status so callers can publish it.
    pub fn record_fill(&mut self, qty: Decimal, now: DateTime<Utc>) -> OrderStatus {
        self.filled_qty += qty;
        self.status = if self.is_fully_filled() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;
        self.status
    }

    /// True when a GTD deadline has passed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.time_in_force, TimeInForce::GTD)
            && self.expires_at.map(|d| now >= d).unwrap_or(false)
    }
}

/// Fill (trade) — an immutable execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: Uuid,
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    /// Sell fills realize `(price - avg_cost) * qty - fee`; buy fills
    /// realize `-fee`.
    pub realized_pnl: Decimal,
    pub executed_at: DateTime<Utc>,
}

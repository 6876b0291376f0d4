use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrderSide;

/// Algo order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgoStatus {
    /// Slices remain to be dispatched
    Working,
    /// All quantity submitted and filled
    Completed,
    /// Finished the schedule without placing the full quantity
    Degraded,
    Cancelled,
}

impl AlgoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgoStatus::Working => "working",
            AlgoStatus::Completed => "completed",
            AlgoStatus::Degraded => "degraded",
            AlgoStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AlgoStatus::Working)
    }
}

impl std::fmt::Display for AlgoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parent of a TWAP execution; owns zero or more child orders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoOrder {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub total_qty: Decimal,
    /// Sum of child fills
    pub filled_qty: Decimal,
    pub slice_interval: Duration,
    pub duration: Duration,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AlgoStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlgoOrder {
    pub fn new(
        account_id: Uuid,
        symbol: impl Into<String>,
        side: OrderSide,
        total_qty: Decimal,
        duration: Duration,
        slice_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            symbol: symbol.into(),
            side,
            total_qty,
            filled_qty: Decimal::ZERO,
            slice_interval,
            duration,
            start_time: now,
            end_time: now + duration,
            status: AlgoStatus::Working,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_qty(&self) -> Decimal {
        self.total_qty - self.filled_qty
    }
}

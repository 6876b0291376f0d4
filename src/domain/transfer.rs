use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a fund transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Deposit,
    Withdrawal,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Deposit => "deposit",
            TransferDirection::Withdrawal => "withdrawal",
        }
    }
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fund transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }

    pub fn can_transition_to(&self, target: TransferStatus) -> bool {
        matches!(
            (self, target),
            (TransferStatus::Pending, TransferStatus::Completed)
                | (TransferStatus::Pending, TransferStatus::Failed)
                | (TransferStatus::Pending, TransferStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deposit/withdrawal record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: TransferDirection,
    pub amount: Decimal,
    /// Withdrawals only
    pub external_destination_id: Option<Uuid>,
    /// Opaque source label for deposits (bank account, card, wallet)
    pub source: Option<String>,
    /// Identifier assigned by the settlement collaborator
    pub settlement_ref: Option<String>,
    pub status: TransferStatus,
    pub failure_reason: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of an external withdrawal destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    PendingReview,
    Active,
    Disabled,
}

impl DestinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationStatus::PendingReview => "pending_review",
            DestinationStatus::Active => "active",
            DestinationStatus::Disabled => "disabled",
        }
    }
}

/// Whitelisted bank/wallet destination for withdrawals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalDestination {
    pub id: Uuid,
    pub account_id: Uuid,
    pub label: String,
    pub status: DestinationStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WithdrawalDestination {
    /// A destination is usable once active and past the time-lock.
    ///
    /// Returns the rejection reason when not eligible.
    pub fn check_eligible(&self, now: DateTime<Utc>, time_lock: Duration) -> Result<(), String> {
        if self.status != DestinationStatus::Active {
            return Err(format!(
                "destination {} is {}",
                self.id,
                self.status.as_str()
            ));
        }

        let approved_at = match self.approved_at {
            Some(ts) => ts,
            None => return Err(format!("destination {} has no approval timestamp", self.id)),
        };

        let unlocked_at = approved_at + time_lock;
        if now < unlocked_at {
            return Err(format!(
                "destination {} is time-locked until {}",
                self.id, unlocked_at
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn destination(status: DestinationStatus, approved_at: Option<DateTime<Utc>>) -> WithdrawalDestination {
        WithdrawalDestination {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            label: "checking".to_string(),
            status,
            approved_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_time_lock_window() {
        let approved = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let dest = destination(DestinationStatus::Active, Some(approved));
        let lock = Duration::hours(24);

        // 23h after approval: still locked
        assert!(dest
            .check_eligible(approved + Duration::hours(23), lock)
            .is_err());
        // exactly at the boundary: unlocked
        assert!(dest
            .check_eligible(approved + Duration::hours(24), lock)
            .is_ok());
        // 25h after approval: unlocked
        assert!(dest
            .check_eligible(approved + Duration::hours(25), lock)
            .is_ok());
    }

    #[test]
    fn test_inactive_destination_rejected() {
        let approved = Utc::now() - Duration::days(30);
        let dest = destination(DestinationStatus::Disabled, Some(approved));
        assert!(dest.check_eligible(Utc::now(), Duration::hours(24)).is_err());

        let dest = destination(DestinationStatus::PendingReview, None);
        assert!(dest.check_eligible(Utc::now(), Duration::hours(24)).is_err());
    }

    #[test]
    fn test_transfer_status_transitions() {
        use TransferStatus::*;

        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }
}

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recurring buy frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl TryFrom<&str> for Frequency {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "biweekly" => Ok(Frequency::Biweekly),
            "monthly" => Ok(Frequency::Monthly),
            _ => Err(format!("Unknown frequency: {}", s)),
        }
    }
}

/// Calendar policy for advancing a schedule date.
///
/// The month rollover rule is deliberately explicit: naive `month + 1`
/// arithmetic overflows end-of-month dates (Jan 31 becoming Mar 3). The
/// shipped policy clamps to the last day of the target month; a different
/// product rule slots in here without touching the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarPolicy {
    #[default]
    ClampToMonthEnd,
}

impl CalendarPolicy {
    /// Next execution date after `from` for the given frequency
    pub fn next_date(&self, from: NaiveDate, frequency: Frequency) -> NaiveDate {
        match frequency {
            Frequency::Daily => from + chrono::Duration::days(1),
            Frequency::Weekly => from + chrono::Duration::days(7),
            Frequency::Biweekly => from + chrono::Duration::days(14),
            Frequency::Monthly => add_months_clamped(from, 1),
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

fn add_months_clamped(date: NaiveDate, months: u32) -> NaiveDate {
    let month0 = date.month0() + months;
    let year = date.year() + (month0 / 12) as i32;
    let month = month0 % 12 + 1;
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).expect("day clamped to month length")
}

/// Periodic buy instruction; `next_execution_date` advances only after a
/// successful dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    /// Cash amount to spend per execution
    pub amount: Decimal,
    pub frequency: Frequency,
    pub next_execution_date: NaiveDate,
    pub active: bool,
}

impl RecurringSchedule {
    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.active && self.next_execution_date <= today
    }
}

/// Copy-trading link; read-only trigger input for the propagator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopySubscription {
    pub id: Uuid,
    pub subscriber_account: Uuid,
    pub trader_account: Uuid,
    /// Cash amount mirrored per trader fill
    pub copy_amount: Decimal,
    pub active: bool,
}

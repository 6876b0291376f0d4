use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the ledger engine
#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Request validation (rejected before persistence)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Business-rule rejections (never retried automatically)
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("Insufficient position in {symbol}: required {required}, available {available}")]
    InsufficientPosition {
        symbol: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("Withdrawal destination not eligible: {0}")]
    DestinationNotEligible(String),

    // Transient errors (order stays working, caller retries)
    #[error("Price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    #[error("Settlement call timed out for transfer {transfer_id}")]
    SettlementTimeout { transfer_id: String },

    // State machine misuse
    #[error("Invalid transition: order {order_id} is {status}")]
    InvalidTransition { order_id: String, status: String },

    // Per-account serialization lost a race, retried once then surfaced
    #[error("Concurrency conflict on account {account_id}: {reason}")]
    ConcurrencyConflict { account_id: String, reason: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Transient errors may be retried by the caller or a scheduler;
    /// everything else is surfaced as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::PriceUnavailable { .. } | EngineError::SettlementTimeout { .. }
        )
    }

    /// Business-rule rejections carry a user-visible reason and must never
    /// be retried automatically.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::InsufficientFunds { .. }
                | EngineError::InsufficientPosition { .. }
                | EngineError::DestinationNotEligible(_)
        )
    }
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

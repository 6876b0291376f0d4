//! Price oracle seam.
//!
//! The engine treats the oracle as a single authoritative value per query,
//! not a stream. Calls are bounded by a timeout with exactly one retry;
//! repeated failure surfaces as `PriceUnavailable` and never blocks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{EngineError, Result};

/// Last-traded price for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceQuote {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// External last-traded-price feed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_last_price(&self, symbol: &str) -> Result<PriceQuote>;
}

/// Timeout-and-retry wrapper around a [`PriceOracle`].
///
/// Exactly one retry; the account lock is never held across these calls.
pub struct OracleGateway {
    inner: Arc<dyn PriceOracle>,
    timeout: Duration,
}

impl OracleGateway {
    pub fn new(inner: Arc<dyn PriceOracle>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub async fn get_last_price(&self, symbol: &str) -> Result<PriceQuote> {
        match self.attempt(symbol).await {
            Ok(quote) => Ok(quote),
            Err(first) => {
                warn!(symbol, "Price fetch failed, retrying once: {}", first);
                self.attempt(symbol).await
            }
        }
    }

    async fn attempt(&self, symbol: &str) -> Result<PriceQuote> {
        match tokio::time::timeout(self.timeout, self.inner.get_last_price(symbol)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: format!("no answer within {}ms", self.timeout.as_millis()),
            }),
        }
    }
}

/// In-memory oracle with settable prices.
///
/// Serves tests and dry runs; a symbol with no price answers
/// `PriceUnavailable`, which is exactly how a stale feed presents.
#[derive(Default)]
pub struct FixedOracle {
    prices: DashMap<String, Decimal>,
}

impl FixedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_string(), price);
    }

    pub fn clear_price(&self, symbol: &str) {
        self.prices.remove(symbol);
    }
}

#[async_trait]
impl PriceOracle for FixedOracle {
    async fn get_last_price(&self, symbol: &str) -> Result<PriceQuote> {
        match self.prices.get(symbol) {
            Some(price) => Ok(PriceQuote {
                price: *price,
                timestamp: Utc::now(),
            }),
            None => Err(EngineError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: "no quote".to_string(),
            }),
        }
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::oracle::{PriceOracle, PriceQuote};

/// REST client for the last-traded-price feed.
///
/// `GET {base_url}/prices/{symbol}` answering
/// `{"symbol": "...", "price": "175.43", "timestamp": "..."}`.
/// Prices travel as strings so no float ever touches a money value.
pub struct HttpPriceOracle {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Decimal,
    timestamp: DateTime<Utc>,
}

impl HttpPriceOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn get_last_price(&self, symbol: &str) -> Result<PriceQuote> {
        let url = format!("{}/prices/{}", self.base_url, symbol);
        let response = self.client.get(&url).send().await.map_err(|e| {
            EngineError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            }
        })?;

        if !response.status().is_success() {
            return Err(EngineError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: format!("feed answered {}", response.status()),
            });
        }

        let body: PriceResponse =
            response
                .json()
                .await
                .map_err(|e| EngineError::PriceUnavailable {
                    symbol: symbol.to_string(),
                    reason: format!("bad feed payload: {}", e),
                })?;

        if body.price <= Decimal::ZERO {
            return Err(EngineError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: format!("non-positive price {}", body.price),
            });
        }

        Ok(PriceQuote {
            price: body.price,
            timestamp: body.timestamp,
        })
    }
}

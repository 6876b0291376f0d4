use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::TransferDirection;
use crate::error::{EngineError, Result};
use crate::transfers::SettlementGateway;

/// REST client for the settlement collaborator.
///
/// `POST {base_url}/transfers` with the transfer details; the provider
/// answers a settlement reference and later reports the outcome on the
/// inbound webhook.
pub struct HttpSettlementGateway {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct InitiateRequest {
    account_id: Uuid,
    direction: &'static str,
    amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    transfer_id: String,
}

impl HttpSettlementGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SettlementGateway for HttpSettlementGateway {
    async fn initiate_transfer(
        &self,
        account_id: Uuid,
        direction: TransferDirection,
        amount: Decimal,
        destination_id: Option<Uuid>,
    ) -> Result<String> {
        let url = format!("{}/transfers", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&InitiateRequest {
                account_id,
                direction: direction.as_str(),
                amount,
                destination_id,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Internal(format!(
                "settlement provider answered {}",
                response.status()
            )));
        }

        let body: InitiateResponse = response.json().await?;
        Ok(body.transfer_id)
    }
}

//! Notification collaborator — produced events, fire-and-forget.
//!
//! Downstream delivery is decoupled: a sink failure is logged and never
//! feeds back into engine state.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Engine event published to the notification collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    #[serde(rename = "order.filled")]
    OrderFilled {
        account_id: Uuid,
        order_id: Uuid,
        symbol: String,
        qty: Decimal,
        price: Decimal,
    },
    #[serde(rename = "order.rejected")]
    OrderRejected {
        account_id: Uuid,
        reason: String,
    },
    #[serde(rename = "transfer.completed")]
    TransferCompleted {
        account_id: Uuid,
        transfer_id: Uuid,
    },
    #[serde(rename = "transfer.failed")]
    TransferFailed {
        account_id: Uuid,
        transfer_id: Uuid,
        reason: String,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: EngineEvent);
}

/// Publish without blocking the caller; errors stay in the sink.
pub fn dispatch(sink: &Arc<dyn NotificationSink>, event: EngineEvent) {
    let sink = sink.clone();
    tokio::spawn(async move {
        sink.publish(event).await;
    });
}

/// Sink that writes events to the log stream
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn publish(&self, event: EngineEvent) {
        info!(?event, "engine event");
    }
}

/// Sink that POSTs events to a webhook endpoint
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn publish(&self, event: EngineEvent) {
        let result = self.client.post(&self.url).json(&event).send().await;
        if let Err(e) = result {
            warn!("Webhook notification failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_serializes_with_dotted_name() {
        let event = EngineEvent::OrderFilled {
            account_id: Uuid::nil(),
            order_id: Uuid::nil(),
            symbol: "AAPL".to_string(),
            qty: dec!(2),
            price: dec!(175.43),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "order.filled");
        assert_eq!(json["symbol"], "AAPL");
    }
}

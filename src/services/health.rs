//! Health check HTTP server for production monitoring.
//!
//! Liveness and readiness probes for process supervision, plus a status
//! endpoint exposing the engine counters.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::services::{Metrics, MetricsSnapshot};

/// Shared state for the health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub db_connected: AtomicBool,
    pub metrics: Arc<Metrics>,
}

impl HealthState {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            started_at: Utc::now(),
            db_connected: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn set_db_connected(&self, connected: bool) {
        self.db_connected.store(connected, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    uptime_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    uptime_seconds: i64,
    db_connected: bool,
    metrics: MetricsSnapshot,
}

/// Axum health/status server
pub struct HealthServer;

impl HealthServer {
    pub async fn serve(state: Arc<HealthState>, port: u16) -> Result<()> {
        let app = Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/status", get(status))
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        info!("Health server listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok",
        timestamp: now,
        uptime_seconds: (now - state.started_at).num_seconds(),
    })
}

async fn ready(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.db_connected.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "database not connected")
    }
}

async fn status(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let now = Utc::now();
    Json(StatusResponse {
        status: "ok",
        timestamp: now,
        uptime_seconds: (now - state.started_at).num_seconds(),
        db_connected: state.db_connected.load(Ordering::SeqCst),
        metrics: state.metrics.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::inc;

    #[test]
    fn test_state_flags() {
        let state = HealthState::new(Arc::new(Metrics::new()));
        assert!(!state.db_connected.load(Ordering::SeqCst));
        state.set_db_connected(true);
        assert!(state.db_connected.load(Ordering::SeqCst));

        inc(&state.metrics.orders_submitted);
        assert_eq!(state.metrics.snapshot().orders_submitted, 1);
    }
}

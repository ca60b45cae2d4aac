use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state. Not ready until the listener is bound.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// 200 while accepting handshakes, 503 before bind and during shutdown.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    let ready = state.is_ready();
    let (code, status) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (code, Json(ReadyResponse { status, ready }))
}

/// Level gauges.
pub mod gauges {
    /// Set the number of handles waiting for a peer.
    pub fn set_pending_handles(count: usize) {
        metrics::gauge!("signald_pending_handles").set(count as f64);
    }

    /// Increment the active sessions gauge.
    pub fn inc_sessions_active() {
        metrics::gauge!("signald_sessions_active").increment(1.0);
    }

    /// Decrement the active sessions gauge.
    pub fn dec_sessions_active() {
        metrics::gauge!("signald_sessions_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a listen request with the given outcome label.
    pub fn listens_total(outcome: &'static str) {
        metrics::counter!("signald_listens_total", "outcome" => outcome).increment(1);
    }

    /// Record a connect request with the given outcome label.
    pub fn connects_total(outcome: &'static str) {
        metrics::counter!("signald_connects_total", "outcome" => outcome).increment(1);
    }

    /// Record a connection closed by the broker with the given status label.
    pub fn connections_closed_total(status: &'static str) {
        metrics::counter!("signald_connections_closed_total", "status" => status).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("signald_messages_relayed_total").increment(1);
    }

    /// Record relayed payload bytes.
    pub fn payload_bytes_total(bytes: u64) {
        metrics::counter!("signald_payload_bytes_total").increment(bytes);
    }
}

/// Duration histograms.
pub mod histograms {
    /// Record how long a pairing lasted, in seconds.
    pub fn session_duration_seconds(value: f64) {
        metrics::histogram!("signald_session_duration_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_handler_reflects_state() {
        let state = HealthState::new();
        let (code, Json(body)) = ready_handler(state.clone()).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.ready);
        assert_eq!(body.status, "unavailable");

        state.set_ready(true);
        let (code, Json(body)) = ready_handler(state).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "ready");
    }

    #[tokio::test]
    async fn health_handler_is_always_ok() {
        let (code, Json(body)) = health_handler().await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "healthy");
    }
}

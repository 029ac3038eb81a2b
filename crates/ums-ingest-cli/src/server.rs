//! HTTP server for metrics and status endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use ums_ingest_core::metrics::CounterSnapshot;
use ums_ingest_core::KafkaSource;

/// Prefix of every exported metric name.
const METRIC_PREFIX: &str = "ums_source";

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub source: Arc<KafkaSource>,
}

/// Status response structure.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub topic: String,
    pub geo_failures: u64,
    pub counters: CounterSnapshot,
}

impl StatusResponse {
    fn from_source(source: &KafkaSource) -> Self {
        Self {
            status: if source.is_running() {
                "running".to_string()
            } else {
                "stopped".to_string()
            },
            topic: source.topic().to_string(),
            geo_failures: source.geo_failures(),
            counters: source.counter().snapshot(),
        }
    }
}

/// Build the router serving `/metrics` and `/status`.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Start the HTTP server; returns when shutdown is signalled.
pub async fn start_server(
    state: Arc<ServerState>,
    metrics_port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = metrics_port, "Failed to bind metrics server");
            return;
        }
    };

    info!(port = metrics_port, "Metrics server started");

    let server = async {
        axum::serve(listener, router(state))
            .await
            .map_err(|e| error!(error = %e, "Metrics server error"))
    };

    tokio::select! {
        _ = server => {}
        _ = shutdown_rx.recv() => {
            info!("Metrics server shutting down");
        }
    }
}

/// Status endpoint handler.
async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = StatusResponse::from_source(&state.source);
    let status_code = if state.source.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.source.counter().export_prometheus_text(METRIC_PREFIX),
    )
}

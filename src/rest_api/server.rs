//! Axum HTTP server for the command API

use std::sync::Arc;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coordinator::MaintenanceCoordinator;
use crate::telemetry::LogBroadcast;
use crate::{Error, Result};

use super::handlers;

pub const DEFAULT_BIND_ADDRESS: &str = "localhost:9993";

/// Shared by all handlers
pub struct ApiState {
    pub coordinator: Arc<MaintenanceCoordinator>,
    /// Parent of every command's cancellation token
    pub shutdown: CancellationToken,
    pub logs: LogBroadcast,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/synchronize", get(handlers::synchronize))
        .route("/teardown", get(handlers::teardown))
        .route("/release", get(handlers::release))
        .route("/releasedelayed", get(handlers::release_delayed))
        .route("/criticalpods", get(handlers::critical_pods))
        .route("/status", get(handlers::status))
        .route("/version", get(handlers::version))
        .route("/healthz", get(handlers::healthz))
        .route("/logstream", get(handlers::log_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the command API until the shutdown token fires
pub async fn run_server(state: Arc<ApiState>, bind_address: &str) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", bind_address, e)))?;
    info!("REST API server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}

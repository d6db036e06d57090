//! HTTP handlers for the command API

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::{body::Body, extract::State, http::StatusCode, Json};
use futures::stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, instrument};

use crate::classifier::pod_ref;
use crate::coordinator::NodeStatus;
use crate::Result;

use super::server::ApiState;

type CommandResponse = (StatusCode, String);

fn failure(command: &str, err: impl std::fmt::Display) -> CommandResponse {
    error!("{} failed: {}", command, err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn run_command<F>(command: &str, fut: F) -> CommandResponse
where
    F: Future<Output = Result<()>>,
{
    match fut.await {
        Ok(()) => (StatusCode::OK, "OK".to_string()),
        Err(e) => failure(command, e),
    }
}

/// Block until this node holds the maintenance lock
#[instrument(skip(state))]
pub async fn synchronize(State(state): State<Arc<ApiState>>) -> CommandResponse {
    let cancel = state.shutdown.child_token();
    run_command("synchronize", state.coordinator.synchronize(&cancel)).await
}

/// Cordon the node and evict its critical pods
#[instrument(skip(state))]
pub async fn teardown(State(state): State<Arc<ApiState>>) -> CommandResponse {
    let cancel = state.shutdown.child_token();
    run_command("teardown", state.coordinator.teardown(&cancel)).await
}

#[instrument(skip(state))]
pub async fn release(State(state): State<Arc<ApiState>>) -> CommandResponse {
    run_command("release", state.coordinator.release()).await
}

#[instrument(skip(state))]
pub async fn release_delayed(State(state): State<Arc<ApiState>>) -> CommandResponse {
    run_command("releasedelayed", state.coordinator.release_delayed()).await
}

/// Critical pods on this node, one `namespace/name` per line
#[instrument(skip(state))]
pub async fn critical_pods(State(state): State<Arc<ApiState>>) -> CommandResponse {
    match state.coordinator.critical_pods().await {
        Ok(pods) => {
            let body: String = pods.iter().map(|p| format!("{}\n", pod_ref(p))).collect();
            (StatusCode::OK, body)
        }
        Err(e) => failure("criticalpods", e),
    }
}

#[instrument(skip(state))]
pub async fn status(
    State(state): State<Arc<ApiState>>,
) -> std::result::Result<Json<NodeStatus>, CommandResponse> {
    state
        .coordinator
        .status()
        .await
        .map(Json)
        .map_err(|e| failure("status", e))
}

pub async fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub async fn healthz() -> &'static str {
    "OK"
}

/// Stream log lines until the client goes away or the server shuts down
pub async fn log_stream(State(state): State<Arc<ApiState>>) -> Body {
    let rx = state.logs.subscribe();
    let shutdown = state.shutdown.clone();

    let lines = stream::unfold((rx, shutdown), |(mut rx, shutdown)| async move {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return None,
            received = rx.recv() => match received {
                Ok(line) => line,
                Err(RecvError::Lagged(skipped)) => format!("... {} lines skipped\n", skipped),
                Err(RecvError::Closed) => return None,
            },
        };
        Some((Ok::<_, Infallible>(line), (rx, shutdown)))
    });

    Body::from_stream(lines)
}

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};

use super::client::BackendClient;
use crate::routes::health::HealthResponse;

pub const SERVICE_NAME: &str = "guildhost-agent";

/// Probe endpoints served by the agent. Readiness waits for a successful
/// handshake.
pub fn router(client: Arc<BackendClient>, version: String) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready))
        .route("/readyz", get(ready))
        .with_state(ProbeState { client, version })
}

#[derive(Clone)]
struct ProbeState {
    client: Arc<BackendClient>,
    version: String,
}

async fn health(State(state): State<ProbeState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse::new("healthy", SERVICE_NAME).with_version(state.version)),
    )
}

async fn ready(State(state): State<ProbeState>) -> (StatusCode, Json<HealthResponse>) {
    if state.client.registration().await.is_some() {
        (
            StatusCode::OK,
            Json(HealthResponse::new("ready", SERVICE_NAME).with_version(state.version)),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse::new("not_ready", SERVICE_NAME).with_version(state.version)),
        )
    }
}

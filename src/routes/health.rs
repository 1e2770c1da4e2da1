use axum::{extract::State, http::StatusCode, response::Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

pub const SERVICE_NAME: &str = "guildhost-backend";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub service: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl HealthResponse {
    pub fn new(status: &'static str, service: &'static str) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            service,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse::new("healthy", SERVICE_NAME).with_version(env!("CARGO_PKG_VERSION"))),
    )
}

pub async fn live() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse::new("alive", SERVICE_NAME)))
}

/// Ready once the store answers.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse::new("ready", SERVICE_NAME))),
        Err(err) => {
            tracing::warn!(
                backend = state.store.backend_name(),
                error = %err,
                "readiness check failed"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse::new("unavailable", SERVICE_NAME)),
            )
        }
    }
}

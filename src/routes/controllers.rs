//! Controller protocol endpoints and their super-admin management surface.
//!
//! The protocol endpoints answer with `{success, message}` bodies that agents
//! parse; the management endpoints use the regular error envelope.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::{bearer_from_headers, AuthenticatedUser, BearerError},
    controllers::{
        protocol::{HandshakeRequest, HandshakeResponse, HeartbeatRequest, HeartbeatResponse},
        RegistryError,
    },
    error::{AppError, AppResult},
    state::AppState,
    tenant::ensure_super_admin,
};

fn protocol_status(err: &RegistryError) -> (StatusCode, String) {
    match err {
        RegistryError::InvalidRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
        RegistryError::InvalidSecret => (StatusCode::UNAUTHORIZED, err.to_string()),
        RegistryError::Unauthorized(_) => {
            (StatusCode::UNAUTHORIZED, "Invalid or expired token".to_string())
        }
        RegistryError::NotFound => (StatusCode::NOT_FOUND, err.to_string()),
        other => {
            tracing::error!(error = %other, "controller protocol request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

fn invalid_format(rejection: JsonRejection) -> String {
    format!("Invalid request format: {}", rejection.body_text())
}

pub async fn handshake(
    State(state): State<AppState>,
    payload: Result<Json<HandshakeRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(HandshakeResponse::rejected(invalid_format(rejection))),
            )
                .into_response()
        }
    };

    match state.registry.handshake(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => {
            let (status, message) = protocol_status(&err);
            (status, Json(HandshakeResponse::rejected(message))).into_response()
        }
    }
}

/// The bearer is checked before the body so that unauthenticated callers
/// learn nothing about the payload shape.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Response {
    let token = match bearer_from_headers(&headers) {
        Ok(token) => token,
        Err(BearerError::Missing) => {
            return failed(StatusCode::UNAUTHORIZED, "Missing authorization header")
        }
        Err(BearerError::Malformed) => {
            return failed(
                StatusCode::UNAUTHORIZED,
                "Invalid authorization header format",
            )
        }
    };
    if let Err(err) = state.registry.verify_token(token) {
        return failed_with(&err);
    }

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return failed(StatusCode::BAD_REQUEST, &invalid_format(rejection)),
    };

    match state.registry.heartbeat(token, request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => failed_with(&err),
    }
}

fn failed(status: StatusCode, message: &str) -> Response {
    (status, Json(HeartbeatResponse::failed(message))).into_response()
}

fn failed_with(err: &RegistryError) -> Response {
    let (status, message) = protocol_status(err);
    failed(status, &message)
}

fn parse_controller_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found("Controller not found"))
}

pub async fn list_controllers(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    ensure_super_admin(&state, &user).await?;
    let controllers = state.registry.list().await?;
    Ok(Json(json!({ "success": true, "controllers": controllers })))
}

pub async fn get_controller(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    ensure_super_admin(&state, &user).await?;
    let controller = state.registry.get_status(parse_controller_id(&id)?).await?;
    Ok(Json(json!({ "success": true, "controller": controller })))
}

pub async fn approve_controller(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    ensure_super_admin(&state, &user).await?;
    let controller = state
        .registry
        .approve(parse_controller_id(&id)?, user.user_id)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Controller approved successfully",
        "controller": controller,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn reject_controller(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    payload: Option<Json<RejectRequest>>,
) -> AppResult<Json<Value>> {
    ensure_super_admin(&state, &user).await?;
    let payload = payload.map(|Json(payload)| payload).unwrap_or_default();
    let message = state
        .registry
        .reject(
            parse_controller_id(&id)?,
            user.user_id,
            payload.reason.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

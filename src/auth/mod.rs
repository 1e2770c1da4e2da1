pub mod broker;
pub mod identity;
pub mod jwt;
pub mod session;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

/// Caller bound to the request by [`require_auth`] or [`optional_auth`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub external_user_id: String,
    pub display_name: String,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerError {
    Missing,
    Malformed,
}

impl BearerError {
    pub fn message(self) -> &'static str {
        match self {
            BearerError::Missing => "Authorization header required",
            BearerError::Malformed => "Invalid authorization header format",
        }
    }
}

/// Splits `Bearer <token>` on the first space. The scheme must be exactly
/// `Bearer` and the token non-empty.
pub fn parse_bearer(value: &str) -> Result<&str, BearerError> {
    let mut parts = value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some("Bearer"), Some(token)) if !token.is_empty() => Ok(token),
        _ => Err(BearerError::Malformed),
    }
}

pub fn bearer_from_headers(headers: &HeaderMap) -> Result<&str, BearerError> {
    let raw = headers.get(AUTHORIZATION).ok_or(BearerError::Missing)?;
    let value = raw.to_str().map_err(|_| BearerError::Malformed)?;
    parse_bearer(value)
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match bearer_from_headers(request.headers()) {
        Ok(token) => token.to_owned(),
        Err(err) => return AppError::unauthorized(err.message()).into_response(),
    };

    match state.broker.validate(&token).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) if err.is_authentication() => {
            tracing::debug!(error = %err, "rejected bearer token");
            AppError::unauthorized("Invalid or expired token")
                .with_details(json!({ "error": err.to_string() }))
                .into_response()
        }
        Err(err) => AppError::from(err).into_response(),
    }
}

/// Binds the caller when a valid bearer is present; otherwise passes the
/// request through untouched.
pub async fn optional_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = bearer_from_headers(request.headers())
        .ok()
        .map(str::to_owned);
    if let Some(token) = token {
        match state.broker.validate(&token).await {
            Ok(user) => {
                request.extensions_mut().insert(user);
            }
            Err(err) => tracing::debug!(error = %err, "ignoring invalid optional bearer"),
        }
    }
    next.run(request).await
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| AppError::unauthorized("User not authenticated"))
    }
}

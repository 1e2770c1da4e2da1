use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{headers::Cookie, typed_header::TypedHeader};
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::{bearer_from_headers, broker::AuthResponse, AuthenticatedUser},
    config::OAUTH_STATE_TTL_MINUTES,
    error::{AppError, AppResult},
    state::AppState,
};

const STATE_COOKIE_NAME: &str = "oauth_state";

pub async fn login(State(state): State<AppState>) -> AppResult<(HeaderMap, Json<Value>)> {
    let oauth_state = generate_state();
    let auth_url = state.broker.login_url(&oauth_state);

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        build_state_cookie(&state, &oauth_state, OAUTH_STATE_TTL_MINUTES * 60)?,
    );

    Ok((
        headers,
        Json(json!({ "auth_url": auth_url, "state": oauth_state })),
    ))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

/// Always clears the state cookie, whatever the outcome.
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
    jar: Option<TypedHeader<Cookie>>,
) -> Response {
    let mut headers = HeaderMap::new();
    match build_state_cookie(&state, "", 0) {
        Ok(cleared) => {
            headers.insert(SET_COOKIE, cleared);
        }
        Err(err) => return err.into_response(),
    }

    match complete_callback(&state, params, jar).await {
        Ok(body) => (headers, Json(body)).into_response(),
        Err(err) => (headers, err).into_response(),
    }
}

async fn complete_callback(
    state: &AppState,
    params: CallbackParams,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<AuthResponse> {
    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AppError::bad_request("Authorization code is required"))?;
    let returned_state = params
        .state
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::bad_request("State parameter is required"))?;

    let expected = jar
        .as_ref()
        .and_then(|TypedHeader(cookies)| cookies.get(STATE_COOKIE_NAME))
        .filter(|value| !value.is_empty());
    if expected != Some(returned_state.as_str()) {
        tracing::warn!("oauth state mismatch on callback");
        return Err(AppError::bad_request("Invalid state parameter"));
    }

    Ok(state.broker.complete_login(&code).await?)
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> AppResult<Json<AuthResponse>> {
    let Json(payload) = payload
        .map_err(|err| AppError::bad_request(format!("Invalid request body: {err}")))?;
    if payload.refresh_token.trim().is_empty() {
        return Err(AppError::bad_request("refresh_token is required"));
    }

    match state.broker.refresh(&payload.refresh_token).await {
        Ok(response) => Ok(Json(response)),
        Err(err) if err.is_authentication() => {
            tracing::debug!(error = %err, "refresh rejected");
            Err(AppError::unauthorized("Failed to refresh token")
                .with_details(json!({ "error": err.to_string() })))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn me(user: AuthenticatedUser) -> Json<Value> {
    Json(json!({ "user": user }))
}

/// Reads the bearer itself: a missing header is a client error here rather
/// than an authentication failure.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let token = bearer_from_headers(&headers).map_err(|err| AppError::bad_request(err.message()))?;

    match state.broker.logout(token).await {
        Ok(()) => Ok(Json(json!({ "message": "Successfully logged out" }))),
        Err(err) if err.is_authentication() => Err(AppError::unauthorized(
            "Invalid or expired token",
        )
        .with_details(json!({ "error": err.to_string() }))),
        Err(err) => Err(AppError::internal(err)),
    }
}

fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn build_state_cookie(state: &AppState, value: &str, max_age: i64) -> AppResult<HeaderValue> {
    let mut parts = vec![format!("{STATE_COOKIE_NAME}={value}")];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Lax".into());
    parts.push(format!("Max-Age={max_age}"));
    if state.config.is_production() {
        parts.push("Secure".into());
    }

    HeaderValue::from_str(&parts.join("; ")).map_err(AppError::internal)
}

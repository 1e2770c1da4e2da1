use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    state::AppState,
    tenant::ensure_super_admin,
};

pub async fn check_access(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let has_access = state.rbac.is_super_admin(user.user_id).await?;
    Ok(Json(json!({ "success": true, "hasAdminAccess": has_access })))
}

pub async fn cleanup_controllers(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    ensure_super_admin(&state, &user).await?;
    let report = state.registry.sweep().await?;
    tracing::info!(
        user_id = %user.user_id,
        marked_inactive = report.marked_inactive,
        deleted = report.deleted,
        "controller cleanup requested"
    );
    Ok(Json(json!({
        "success": true,
        "message": "Inactive controllers cleaned up successfully",
        "marked_inactive": report.marked_inactive,
        "deleted": report.deleted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SuperAdminRequest {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

fn parse_request(
    payload: Result<Json<SuperAdminRequest>, JsonRejection>,
) -> AppResult<SuperAdminRequest> {
    payload
        .map(|Json(request)| request)
        .map_err(|err| AppError::bad_request(format!("Invalid request body: {}", err.body_text())))
}

/// The engine itself enforces that the caller is a super admin, so a
/// forbidden answer carries its message.
pub async fn assign_super_admin(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Result<Json<SuperAdminRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let request = parse_request(payload)?;
    let membership = state
        .rbac
        .assign_super_admin(user.user_id, request.user_id, request.tenant_id)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Super admin role assigned",
        "membership": membership,
    })))
}

pub async fn remove_super_admin(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Result<Json<SuperAdminRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let request = parse_request(payload)?;
    let membership = state
        .rbac
        .remove_super_admin(user.user_id, request.user_id, request.tenant_id)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Super admin role removed",
        "membership": membership,
    })))
}

//! Tenant-scoped RBAC management. Every handler here runs behind
//! `require_auth` and `require_tenant`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::InternalRole,
    rbac::permission::{ROLE_DELETE, ROLE_READ, ROLE_WRITE, USER_WRITE},
    state::AppState,
    tenant::{ensure_permission, CurrentTenant},
};

pub async fn tenant_info(tenant: CurrentTenant) -> Json<Value> {
    Json(json!({ "tenant": tenant.0 }))
}

pub async fn my_permissions(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    tenant: CurrentTenant,
) -> AppResult<Json<Value>> {
    let permissions = state
        .rbac
        .get_user_permissions(user.user_id, tenant.id())
        .await?;
    Ok(Json(json!({
        "tenant_id": tenant.id(),
        "permissions": permissions,
    })))
}

pub async fn list_roles(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    tenant: CurrentTenant,
) -> AppResult<Json<Value>> {
    ensure_permission(&state, &user, &tenant, ROLE_READ).await?;
    let roles = state.rbac.list_roles(tenant.id()).await?;
    Ok(Json(json!({ "roles": roles })))
}

#[derive(Debug, Deserialize)]
pub struct RolePayload {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

fn role_payload(payload: Result<Json<RolePayload>, JsonRejection>) -> AppResult<RolePayload> {
    payload
        .map(|Json(role)| role)
        .map_err(|err| AppError::bad_request(format!("Invalid request body: {}", err.body_text())))
}

pub async fn create_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    tenant: CurrentTenant,
    payload: Result<Json<RolePayload>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Value>)> {
    ensure_permission(&state, &user, &tenant, ROLE_WRITE).await?;
    let payload = role_payload(payload)?;
    let role = state
        .rbac
        .create_role(tenant.id(), &payload.name, &payload.permissions, false)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "role": role }))))
}

/// Roles of other tenants are reported as missing.
async fn tenant_role(
    state: &AppState,
    tenant: &CurrentTenant,
    raw: &str,
) -> AppResult<InternalRole> {
    let role_id = Uuid::parse_str(raw).map_err(|_| AppError::not_found("Role not found"))?;
    let role = state.rbac.get_role(role_id).await?;
    if role.tenant_id != tenant.id() {
        return Err(AppError::not_found("Role not found"));
    }
    Ok(role)
}

pub async fn update_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    tenant: CurrentTenant,
    Path(role_id): Path<String>,
    payload: Result<Json<RolePayload>, JsonRejection>,
) -> AppResult<Json<Value>> {
    ensure_permission(&state, &user, &tenant, ROLE_WRITE).await?;
    let payload = role_payload(payload)?;
    let role = tenant_role(&state, &tenant, &role_id).await?;
    let updated = state
        .rbac
        .update_role(role.id, &payload.name, &payload.permissions)
        .await?;
    Ok(Json(json!({ "role": updated })))
}

pub async fn delete_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    tenant: CurrentTenant,
    Path(role_id): Path<String>,
) -> AppResult<Json<Value>> {
    ensure_permission(&state, &user, &tenant, ROLE_DELETE).await?;
    let role = tenant_role(&state, &tenant, &role_id).await?;
    state.rbac.delete_role(role.id).await?;
    Ok(Json(json!({ "message": "Role deleted successfully" })))
}

pub async fn assign_member_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    tenant: CurrentTenant,
    Path((member_id, role_name)): Path<(Uuid, String)>,
) -> AppResult<Json<Value>> {
    ensure_permission(&state, &user, &tenant, USER_WRITE).await?;
    let membership = state
        .rbac
        .assign_role(member_id, tenant.id(), &role_name)
        .await?;
    tracing::info!(
        actor_id = %user.user_id,
        member_id = %member_id,
        tenant_id = %tenant.id(),
        role = %role_name,
        "member role assigned"
    );
    Ok(Json(json!({ "membership": membership })))
}

pub async fn remove_member_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    tenant: CurrentTenant,
    Path((member_id, role_name)): Path<(Uuid, String)>,
) -> AppResult<Json<Value>> {
    ensure_permission(&state, &user, &tenant, USER_WRITE).await?;
    let membership = state
        .rbac
        .remove_role(member_id, tenant.id(), &role_name)
        .await?;
    Ok(Json(json!({ "membership": membership })))
}

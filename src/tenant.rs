//! Binds tenant-scoped requests to a tenant the caller may read.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult, ErrorCode},
    models::Tenant,
    rbac::permission::TENANT_ACCESS,
    state::AppState,
};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const TENANT_QUERY_PARAM: &str = "tenant_id";

/// Tenant bound by [`require_tenant`] or [`optional_tenant`].
#[derive(Debug, Clone)]
pub struct CurrentTenant(pub Tenant);

impl CurrentTenant {
    pub fn id(&self) -> Uuid {
        self.0.id
    }
}

/// Header first, then the query string.
fn raw_tenant_id(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some(value.to_string());
    }

    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == TENANT_QUERY_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

async fn resolve_tenant(state: &AppState, parts: &Parts) -> AppResult<Tenant> {
    let raw = raw_tenant_id(parts).ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::MissingTenant,
            "Tenant ID is required",
        )
    })?;
    let tenant_id = Uuid::parse_str(&raw).map_err(|_| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::TenantRequired,
            "Tenant ID must be a valid UUID",
        )
    })?;

    let user = parts
        .extensions
        .get::<AuthenticatedUser>()
        .ok_or_else(|| AppError::unauthorized("User not authenticated"))?;

    if !state
        .rbac
        .has_permission(user.user_id, tenant_id, TENANT_ACCESS)
        .await?
    {
        return Err(AppError::forbidden("Access denied to this tenant"));
    }

    state
        .store
        .get_tenant(tenant_id)
        .await?
        .ok_or_else(|| AppError::not_found("Tenant not found"))
}

pub async fn require_tenant(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    match resolve_tenant(&state, &parts).await {
        Ok(tenant) => {
            parts.extensions.insert(CurrentTenant(tenant));
            next.run(Request::from_parts(parts, body)).await
        }
        Err(err) => err.into_response(),
    }
}

/// Same resolution as [`require_tenant`]; any failure leaves the request
/// without a tenant.
pub async fn optional_tenant(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    if let Ok(tenant) = resolve_tenant(&state, &parts).await {
        parts.extensions.insert(CurrentTenant(tenant));
    }
    next.run(Request::from_parts(parts, body)).await
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentTenant
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<CurrentTenant>().cloned().ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::MissingTenantContext,
                "Tenant context is required",
            )
        })
    }
}

fn insufficient(required: serde_json::Value) -> AppError {
    AppError::new(
        StatusCode::FORBIDDEN,
        ErrorCode::InsufficientPermissions,
        "Insufficient permissions for this operation",
    )
    .with_details(required)
}

pub async fn ensure_permission(
    state: &AppState,
    user: &AuthenticatedUser,
    tenant: &CurrentTenant,
    permission: &str,
) -> AppResult<()> {
    if state
        .rbac
        .has_permission(user.user_id, tenant.id(), permission)
        .await?
    {
        return Ok(());
    }
    Err(insufficient(json!({ "required_permission": permission })))
}

pub async fn ensure_any_permission(
    state: &AppState,
    user: &AuthenticatedUser,
    tenant: &CurrentTenant,
    permissions: &[&str],
) -> AppResult<()> {
    if state
        .rbac
        .has_any_permission(user.user_id, tenant.id(), permissions)
        .await?
    {
        return Ok(());
    }
    Err(insufficient(json!({ "required_permissions": permissions })))
}

pub fn ensure_owner(user: &AuthenticatedUser, tenant: &CurrentTenant) -> AppResult<()> {
    if tenant.0.owner_user_id == user.user_id {
        return Ok(());
    }
    Err(AppError::new(
        StatusCode::FORBIDDEN,
        ErrorCode::OwnerOnly,
        "This operation is restricted to tenant owners",
    ))
}

pub async fn ensure_super_admin(state: &AppState, user: &AuthenticatedUser) -> AppResult<()> {
    if state.rbac.is_super_admin(user.user_id).await? {
        return Ok(());
    }
    Err(AppError::forbidden("Super admin access required"))
}

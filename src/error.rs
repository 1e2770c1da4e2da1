use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;

pub type AppResult<T> = Result<T, AppError>;

/// Machine-readable error codes carried in the error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    ValidationError,
    Forbidden,
    NotFound,
    TenantRequired,
    MissingTenant,
    MissingTenantContext,
    DiscordApiError,
    DiscordTokenMissing,
    InsufficientPermissions,
    OwnerOnly,
    InternalError,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
    details: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
    }

    pub fn internal<E: Display>(error: E) -> Self {
        tracing::error!(error = %error, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            "Internal server error",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl From<crate::store::StoreError> for AppError {
    fn from(value: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match value {
            StoreError::NotFound(what) => AppError::not_found(format!("{what} not found")),
            StoreError::Conflict(message) => AppError::bad_request(message),
            StoreError::Unexpected(err) => AppError::internal(err),
        }
    }
}

impl From<crate::rbac::RbacError> for AppError {
    fn from(value: crate::rbac::RbacError) -> Self {
        use crate::rbac::RbacError;
        match value {
            RbacError::RoleNotFound => AppError::not_found("Role not found"),
            RbacError::UserNotFound => AppError::not_found("User not found"),
            RbacError::TenantNotFound => AppError::not_found("Tenant not found"),
            err @ (RbacError::SystemRole
            | RbacError::EmptyRoleName
            | RbacError::InvalidPermission(_)) => AppError::bad_request(err.to_string()),
            err @ (RbacError::NotSuperAdmin(_) | RbacError::InitialSuperAdmin(_)) => {
                AppError::forbidden(err.to_string())
            }
            RbacError::Store(err) => err.into(),
        }
    }
}

impl From<crate::controllers::RegistryError> for AppError {
    fn from(value: crate::controllers::RegistryError) -> Self {
        use crate::controllers::RegistryError;
        match value {
            RegistryError::NotFound => AppError::not_found("Controller not found"),
            err @ (RegistryError::NotPending | RegistryError::InvalidRequest(_)) => {
                AppError::bad_request(err.to_string())
            }
            RegistryError::InvalidSecret => AppError::unauthorized("Invalid handshake secret"),
            RegistryError::Unauthorized(_) => AppError::unauthorized("Invalid or expired token"),
            RegistryError::Store(err) => err.into(),
            err @ (RegistryError::Token(_) | RegistryError::Contended(_)) => {
                AppError::internal(err)
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::internal(value)
    }
}

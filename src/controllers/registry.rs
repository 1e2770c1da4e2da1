//! Registration, approval, and liveness of remote cluster controllers.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::protocol::{
    verify_handshake_signature, HandshakeRequest, HandshakeResponse, HeartbeatRequest,
    HeartbeatResponse, HEARTBEAT_PATH,
};
use crate::{
    auth::jwt::{Claims, TokenCodec, TokenError, TokenKind},
    models::{Controller, ControllerStatus, NewController},
    store::{Store, StoreError},
};

const REGISTERED: &str = "Controller registered successfully - awaiting approval";
const REREGISTERED: &str = "Controller re-registered successfully";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid handshake secret")]
    InvalidSecret,
    #[error("{0}")]
    InvalidRequest(String),
    #[error("controller token rejected: {0}")]
    Unauthorized(TokenError),
    #[error("Controller not found")]
    NotFound,
    #[error("Controller is not in pending approval status")]
    NotPending,
    #[error("failed to mint controller token: {0}")]
    Token(TokenError),
    #[error("controller registration for cluster {0} kept racing")]
    Contended(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Gate on handshake requests before any state is touched.
pub trait HandshakeVerifier: Send + Sync {
    fn verify(&self, request: &HandshakeRequest) -> bool;
}

/// Checks the optional `signature` against a shared secret. With no secret
/// configured every request passes. Unsigned requests pass with a warning
/// unless signatures are required.
pub struct SharedSecretVerifier {
    secret: Option<String>,
    require_signature: bool,
}

impl SharedSecretVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|value| !value.is_empty()),
            require_signature: false,
        }
    }

    pub fn require_signature(mut self, required: bool) -> Self {
        self.require_signature = required;
        self
    }
}

impl HandshakeVerifier for SharedSecretVerifier {
    fn verify(&self, request: &HandshakeRequest) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            return true;
        };
        match request.signature.as_deref() {
            Some(signature) => verify_handshake_signature(
                secret.as_bytes(),
                &request.cluster_id,
                &request.nonce,
                signature,
            ),
            None if self.require_signature => {
                tracing::warn!(cluster_id = %request.cluster_id, "rejecting unsigned handshake");
                false
            }
            None => {
                tracing::warn!(
                    cluster_id = %request.cluster_id,
                    "accepting unsigned handshake while a handshake secret is configured"
                );
                true
            }
        }
    }
}

/// Controller row plus the derived liveness fields.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub id: Uuid,
    pub cluster_id: String,
    pub cluster_name: String,
    pub version: String,
    pub status: ControllerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<i64>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Online means the last heartbeat is younger than `max_age`. Uptime is only
/// reported while online.
pub fn liveness(
    controller: &Controller,
    now: DateTime<Utc>,
    max_age: Duration,
) -> ControllerSnapshot {
    let is_online = now - controller.last_heartbeat < max_age;
    ControllerSnapshot {
        id: controller.id,
        cluster_id: controller.cluster_id.clone(),
        cluster_name: controller.cluster_name.clone(),
        version: controller.version.clone(),
        status: controller.status,
        last_heartbeat: controller.last_heartbeat,
        is_online,
        uptime_seconds: is_online.then(|| (now - controller.created_at).num_seconds()),
        approved_at: controller.approved_at,
        approved_by: controller.approved_by,
        created_at: controller.created_at,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub marked_inactive: u64,
    pub deleted: u64,
}

pub struct ControllerRegistry {
    store: Arc<dyn Store>,
    codec: TokenCodec,
    verifier: Box<dyn HandshakeVerifier>,
    heartbeat_ttl: Duration,
    max_heartbeat_age: Duration,
}

impl ControllerRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        codec: TokenCodec,
        verifier: Box<dyn HandshakeVerifier>,
        heartbeat_ttl: Duration,
        max_heartbeat_age: Duration,
    ) -> Self {
        Self {
            store,
            codec,
            verifier,
            heartbeat_ttl,
            max_heartbeat_age,
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    /// Registers a new cluster as `pending_approval`, or refreshes a known
    /// one while keeping its status.
    pub async fn handshake(
        &self,
        request: HandshakeRequest,
    ) -> RegistryResult<HandshakeResponse> {
        if let Some(field) = request.missing_field() {
            return Err(RegistryError::InvalidRequest(format!("{field} is required")));
        }
        if !self.verifier.verify(&request) {
            tracing::warn!(cluster_id = %request.cluster_id, "handshake secret mismatch");
            return Err(RegistryError::InvalidSecret);
        }

        // A concurrent handshake or cleanup can flip the row between lookup
        // and write; one retry settles it.
        for _ in 0..2 {
            let now = Utc::now();
            match self.store.find_controller_by_cluster(&request.cluster_id).await? {
                Some(existing) => {
                    if let Some(controller) = self.reregister(existing.id, &request, now).await? {
                        tracing::info!(
                            controller_id = %controller.id,
                            cluster_id = %controller.cluster_id,
                            status = %controller.status,
                            "controller re-registered"
                        );
                        return Ok(self.handshake_response(&controller, REREGISTERED));
                    }
                }
                None => match self.register(&request, now).await {
                    Ok(controller) => {
                        tracing::info!(
                            controller_id = %controller.id,
                            cluster_id = %controller.cluster_id,
                            "controller registered, awaiting approval"
                        );
                        return Ok(self.handshake_response(&controller, REGISTERED));
                    }
                    Err(RegistryError::Store(StoreError::Conflict(_))) => continue,
                    Err(err) => return Err(err),
                },
            }
        }
        Err(RegistryError::Contended(request.cluster_id))
    }

    async fn register(
        &self,
        request: &HandshakeRequest,
        now: DateTime<Utc>,
    ) -> RegistryResult<Controller> {
        let id = Uuid::new_v4();
        let token = self
            .codec
            .mint_controller_at(id, &request.cluster_id, now)
            .map_err(RegistryError::Token)?;
        Ok(self
            .store
            .insert_controller(NewController {
                id,
                cluster_id: request.cluster_id.clone(),
                cluster_name: request.cluster_name.clone(),
                version: request.version.clone(),
                last_heartbeat: now,
                status: ControllerStatus::PendingApproval,
                handshake_token: token.token,
            })
            .await?)
    }

    async fn reregister(
        &self,
        controller_id: Uuid,
        request: &HandshakeRequest,
        now: DateTime<Utc>,
    ) -> RegistryResult<Option<Controller>> {
        let token = self
            .codec
            .mint_controller_at(controller_id, &request.cluster_id, now)
            .map_err(RegistryError::Token)?;
        let cluster_name = request.cluster_name.clone();
        let version = request.version.clone();

        let updated = self
            .store
            .update_controller(
                controller_id,
                Box::new(move |controller| {
                    controller.cluster_name = cluster_name;
                    controller.version = version;
                    controller.last_heartbeat = controller.last_heartbeat.max(now);
                    controller.handshake_token = token.token;
                    controller.updated_at = now;
                    true
                }),
            )
            .await?;
        Ok(updated.map(|mutation| mutation.value))
    }

    fn handshake_response(&self, controller: &Controller, message: &str) -> HandshakeResponse {
        HandshakeResponse {
            success: true,
            controller_id: Some(controller.id),
            token: Some(controller.handshake_token.clone()),
            message: message.to_string(),
            heartbeat_url: Some(HEARTBEAT_PATH.to_string()),
            heartbeat_ttl: Some(self.heartbeat_ttl.num_seconds()),
        }
    }

    /// Checks a controller credential without touching the store.
    pub fn verify_token(&self, token: &str) -> RegistryResult<Claims> {
        self.codec
            .verify_kind(token, TokenKind::Controller)
            .map_err(RegistryError::Unauthorized)
    }

    /// Authenticates `token` as a controller credential and records the
    /// heartbeat. Controllers awaiting approval or rejected only get their
    /// timestamp refreshed.
    pub async fn heartbeat(
        &self,
        token: &str,
        request: HeartbeatRequest,
    ) -> RegistryResult<HeartbeatResponse> {
        let claims = self.verify_token(token)?;
        let controller_id = Uuid::parse_str(&claims.sub).map_err(|_| RegistryError::NotFound)?;

        if !request.status.is_reportable() {
            return Err(RegistryError::InvalidRequest(format!(
                "status must be one of active, degraded, error; got {}",
                request.status
            )));
        }

        let now = Utc::now();
        let requested = request.status;
        let updated = self
            .store
            .update_controller(
                controller_id,
                Box::new(move |controller| {
                    controller.last_heartbeat = controller.last_heartbeat.max(now);
                    controller.updated_at = now;
                    if !matches!(
                        controller.status,
                        ControllerStatus::PendingApproval | ControllerStatus::Rejected
                    ) {
                        controller.status = requested;
                    }
                    true
                }),
            )
            .await?
            .ok_or(RegistryError::NotFound)?;

        let controller = updated.value;
        tracing::debug!(
            controller_id = %controller.id,
            status = %controller.status,
            message = request.message.as_deref().unwrap_or_default(),
            "heartbeat received"
        );

        let message = match controller.status {
            ControllerStatus::PendingApproval => "Heartbeat received - controller awaiting approval",
            ControllerStatus::Rejected => "Heartbeat received - controller has been rejected",
            _ => "Heartbeat received",
        };
        Ok(HeartbeatResponse::ok(message))
    }

    pub async fn get_status(&self, controller_id: Uuid) -> RegistryResult<ControllerSnapshot> {
        let controller = self
            .store
            .get_controller(controller_id)
            .await?
            .ok_or(RegistryError::NotFound)?;
        Ok(liveness(&controller, Utc::now(), self.max_heartbeat_age))
    }

    pub async fn list(&self) -> RegistryResult<Vec<ControllerSnapshot>> {
        let now = Utc::now();
        let mut controllers = self.store.list_controllers().await?;
        controllers.sort_by_key(|controller| controller.created_at);
        Ok(controllers
            .iter()
            .map(|controller| liveness(controller, now, self.max_heartbeat_age))
            .collect())
    }

    pub async fn approve(
        &self,
        controller_id: Uuid,
        approved_by: Uuid,
    ) -> RegistryResult<Controller> {
        let now = Utc::now();
        let result = self
            .store
            .update_controller(
                controller_id,
                Box::new(move |controller| {
                    if controller.status != ControllerStatus::PendingApproval {
                        return false;
                    }
                    controller.status = ControllerStatus::Active;
                    controller.approved_at = Some(now);
                    controller.approved_by = Some(approved_by);
                    controller.updated_at = now;
                    true
                }),
            )
            .await?
            .ok_or(RegistryError::NotFound)?;

        if !result.applied {
            return Err(RegistryError::NotPending);
        }
        tracing::info!(
            controller_id = %controller_id,
            approved_by = %approved_by,
            "controller approved"
        );
        Ok(result.value)
    }

    /// Moves the controller to `rejected` from any state. Returns the
    /// operator-facing message.
    pub async fn reject(
        &self,
        controller_id: Uuid,
        rejected_by: Uuid,
        reason: Option<&str>,
    ) -> RegistryResult<String> {
        let now = Utc::now();
        self.store
            .update_controller(
                controller_id,
                Box::new(move |controller| {
                    controller.status = ControllerStatus::Rejected;
                    controller.updated_at = now;
                    true
                }),
            )
            .await?
            .ok_or(RegistryError::NotFound)?;

        let reason = reason.map(str::trim).filter(|reason| !reason.is_empty());
        tracing::info!(
            controller_id = %controller_id,
            rejected_by = %rejected_by,
            reason = reason.unwrap_or_default(),
            "controller rejected"
        );
        Ok(match reason {
            Some(reason) => format!("Controller rejected: {reason}"),
            None => "Controller rejected successfully".to_string(),
        })
    }

    /// Deletes controllers silent for more than twice the max heartbeat age.
    pub async fn cleanup(&self) -> RegistryResult<u64> {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> RegistryResult<u64> {
        let cutoff = now - self.max_heartbeat_age * 2;
        let deleted = self.store.delete_controllers_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "removed stale controllers");
        }
        Ok(deleted)
    }

    /// Marks running controllers that stopped reporting as `inactive`.
    pub async fn mark_stale_at(&self, now: DateTime<Utc>) -> RegistryResult<u64> {
        let marked = self
            .store
            .mark_controllers_inactive(now - self.max_heartbeat_age, now)
            .await?;
        if marked > 0 {
            tracing::info!(marked, "marked silent controllers inactive");
        }
        Ok(marked)
    }

    pub async fn sweep(&self) -> RegistryResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> RegistryResult<SweepReport> {
        Ok(SweepReport {
            marked_inactive: self.mark_stale_at(now).await?,
            deleted: self.cleanup_at(now).await?,
        })
    }
}

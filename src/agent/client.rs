//! HTTP transport from a cluster agent to the control plane.

use std::time::Duration;

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    config::AgentConfig,
    controllers::protocol::{
        sign_handshake, HandshakeRequest, HandshakeResponse, HeartbeatRequest, HeartbeatResponse,
        HANDSHAKE_PATH, HEARTBEAT_PATH,
    },
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to reach control plane: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{operation} failed with status {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
    #[error("not registered - perform handshake first")]
    NotRegistered,
    #[error("failed to sign handshake: {0}")]
    Signing(String),
}

/// Credentials issued by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub controller_id: Uuid,
    pub token: String,
    pub heartbeat_url: String,
    pub heartbeat_interval: Duration,
    pub message: String,
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn send_heartbeat(&self, report: HeartbeatRequest)
        -> Result<HeartbeatResponse, AgentError>;
}

pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    cluster_id: String,
    cluster_name: String,
    version: String,
    handshake_secret: Option<String>,
    registration: RwLock<Option<Registration>>,
}

impl BackendClient {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            cluster_id: config.cluster_id.clone(),
            cluster_name: config.cluster_name.clone(),
            version: config.version.clone(),
            handshake_secret: config.handshake_secret.clone(),
            registration: RwLock::new(None),
        })
    }

    pub async fn registration(&self) -> Option<Registration> {
        self.registration.read().await.clone()
    }

    /// Introduces this cluster and keeps the issued token for later heartbeats.
    pub async fn handshake(&self) -> Result<Registration, AgentError> {
        let nonce = generate_nonce();
        let signature = self
            .handshake_secret
            .as_deref()
            .map(|secret| sign_handshake(secret.as_bytes(), &self.cluster_id, &nonce))
            .transpose()
            .map_err(|err| AgentError::Signing(err.to_string()))?;

        let request = HandshakeRequest {
            cluster_id: self.cluster_id.clone(),
            cluster_name: self.cluster_name.clone(),
            version: self.version.clone(),
            nonce,
            signature,
        };
        let response: HandshakeResponse = self
            .post_json("handshake", HANDSHAKE_PATH, &request, None)
            .await?;

        if !response.success {
            return Err(AgentError::Rejected {
                operation: "handshake",
                message: response.message,
            });
        }
        let (Some(controller_id), Some(token)) = (response.controller_id, response.token) else {
            return Err(AgentError::Rejected {
                operation: "handshake",
                message: "response carried no credentials".to_string(),
            });
        };

        let heartbeat_interval = response
            .heartbeat_ttl
            .filter(|seconds| *seconds > 0)
            .map(|seconds| Duration::from_secs(seconds as u64))
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let registration = Registration {
            controller_id,
            token,
            heartbeat_url: response
                .heartbeat_url
                .unwrap_or_else(|| HEARTBEAT_PATH.to_string()),
            heartbeat_interval,
            message: response.message,
        };
        *self.registration.write().await = Some(registration.clone());
        Ok(registration)
    }

    async fn post_json<B, T>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<T, AgentError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("message")?.as_str().map(str::to_string))
                .unwrap_or_default();
            return Err(AgentError::Status {
                operation,
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ControlPlaneClient for BackendClient {
    async fn send_heartbeat(
        &self,
        report: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, AgentError> {
        let registration = self.registration().await.ok_or(AgentError::NotRegistered)?;
        let response: HeartbeatResponse = self
            .post_json(
                "heartbeat",
                &registration.heartbeat_url,
                &report,
                Some(&registration.token),
            )
            .await?;
        if !response.success {
            return Err(AgentError::Rejected {
                operation: "heartbeat",
                message: response.message,
            });
        }
        Ok(response)
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_random_hex() {
        let first = generate_nonce();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, generate_nonce());
    }

    #[tokio::test]
    async fn heartbeat_requires_a_handshake() {
        let client = BackendClient::new(&AgentConfig {
            backend_url: "http://127.0.0.1:9".into(),
            cluster_id: "c1".into(),
            cluster_name: "C".into(),
            version: "0.1.0".into(),
            health_port: 0,
            handshake_secret: None,
        })
        .unwrap();

        let report = HeartbeatRequest {
            status: crate::models::ControllerStatus::Active,
            message: None,
            metrics: Default::default(),
            resources: Default::default(),
        };
        assert!(matches!(
            client.send_heartbeat(report).await,
            Err(AgentError::NotRegistered)
        ));
    }
}

//! Wire types exchanged between the control plane and cluster agents.

use std::collections::HashMap;

use hmac::{digest::InvalidLength, Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::models::ControllerStatus;

pub const HANDSHAKE_PATH: &str = "/api/controller/handshake";
pub const HEARTBEAT_PATH: &str = "/api/controller/heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub cluster_id: String,
    pub cluster_name: String,
    pub version: String,
    pub nonce: String,
    /// Hex HMAC-SHA256 of `cluster_id:nonce` under the shared handshake secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl HandshakeRequest {
    /// Name of the first required field that is blank.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("cluster_id", &self.cluster_id),
            ("cluster_name", &self.cluster_name),
            ("version", &self.version),
            ("nonce", &self.nonce),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_ttl: Option<i64>,
}

impl HandshakeResponse {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            controller_id: None,
            token: None,
            message: message.into(),
            heartbeat_url: None,
            heartbeat_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub status: ControllerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resources: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl HeartbeatResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

fn handshake_mac(
    secret: &[u8],
    cluster_id: &str,
    nonce: &str,
) -> Result<HmacSha256, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(cluster_id.as_bytes());
    mac.update(b":");
    mac.update(nonce.as_bytes());
    Ok(mac)
}

pub fn sign_handshake(
    secret: &[u8],
    cluster_id: &str,
    nonce: &str,
) -> Result<String, InvalidLength> {
    let mac = handshake_mac(secret, cluster_id, nonce)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature produced by [`sign_handshake`].
pub fn verify_handshake_signature(
    secret: &[u8],
    cluster_id: &str,
    nonce: &str,
    signature: &str,
) -> bool {
    let Ok(raw) = hex::decode(signature) else {
        return false;
    };
    handshake_mac(secret, cluster_id, nonce)
        .map(|mac| mac.verify_slice(&raw).is_ok())
        .unwrap_or(false)
}

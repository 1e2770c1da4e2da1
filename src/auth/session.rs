//! Live session state with per-key TTLs.
//!
//! Two keys are kept per session:
//! - `session:{id}` holds the serialized [`Session`]
//! - `refresh:{token}` holds the session id
//!
//! Both expire together at `expires_at`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_refresh_token: Option<String>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already expired")]
    AlreadyExpired,
    #[error("session not found")]
    NotFound,
    #[error("new expiry must be in the future")]
    InvalidExpiry,
    #[error("session cache error: {0}")]
    Backend(String),
    #[error("failed to encode session: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn store(&self, session: &Session) -> SessionResult<()>;
    async fn get(&self, session_id: Uuid) -> SessionResult<Session>;
    async fn get_by_refresh(&self, refresh_token: &str) -> SessionResult<Session>;
    /// Idempotent; a missing session counts as deleted.
    async fn delete(&self, session_id: Uuid) -> SessionResult<()>;
    async fn update_expiry(&self, session_id: Uuid, new_expiry: DateTime<Utc>)
        -> SessionResult<()>;
}

fn session_key(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

fn refresh_key(refresh_token: &str) -> String {
    format!("refresh:{refresh_token}")
}

fn ttl_millis(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> SessionResult<u64> {
    let remaining = (expires_at - now).num_milliseconds();
    if remaining <= 0 {
        return Err(SessionError::AlreadyExpired);
    }
    Ok(remaining as u64)
}

#[derive(Clone)]
pub struct RedisSessionCache {
    pool: Pool,
}

impl RedisSessionCache {
    pub fn new(url: &str, pool_max: usize) -> anyhow::Result<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| anyhow::anyhow!("failed to create redis pool: {e}"))?;
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> SessionResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn connection(&self) -> SessionResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(backend)
    }

    async fn load(
        &self,
        conn: &mut deadpool_redis::Connection,
        session_id: Uuid,
    ) -> SessionResult<Option<Session>> {
        let raw: Option<String> = conn.get(session_key(session_id)).await.map_err(backend)?;
        raw.map(|value| serde_json::from_str(&value).map_err(SessionError::from))
            .transpose()
    }
}

fn backend(err: impl std::fmt::Display) -> SessionError {
    SessionError::Backend(err.to_string())
}

#[async_trait]
impl SessionCache for RedisSessionCache {
    async fn store(&self, session: &Session) -> SessionResult<()> {
        let ttl = ttl_millis(session.expires_at, Utc::now())?;
        let payload = serde_json::to_string(session)?;
        let mut conn = self.connection().await?;
        let replaced = self
            .load(&mut conn, session.id)
            .await?
            .map(|previous| previous.refresh_token)
            .filter(|previous| *previous != session.refresh_token);

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(previous) = replaced {
            pipe.del(refresh_key(&previous)).ignore();
        }
        pipe.pset_ex(session_key(session.id), payload, ttl)
            .ignore()
            .pset_ex(refresh_key(&session.refresh_token), session.id.to_string(), ttl)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn get(&self, session_id: Uuid) -> SessionResult<Session> {
        let mut conn = self.connection().await?;
        self.load(&mut conn, session_id)
            .await?
            .ok_or(SessionError::NotFound)
    }

    async fn get_by_refresh(&self, refresh_token: &str) -> SessionResult<Session> {
        let mut conn = self.connection().await?;
        let session_id: Option<String> =
            conn.get(refresh_key(refresh_token)).await.map_err(backend)?;
        let session_id = session_id
            .and_then(|raw| Uuid::parse_str(&raw).ok())
            .ok_or(SessionError::NotFound)?;
        self.load(&mut conn, session_id)
            .await?
            .ok_or(SessionError::NotFound)
    }

    async fn delete(&self, session_id: Uuid) -> SessionResult<()> {
        let mut conn = self.connection().await?;
        let Some(session) = self.load(&mut conn, session_id).await? else {
            return Ok(());
        };

        redis::pipe()
            .atomic()
            .del(session_key(session_id))
            .ignore()
            .del(refresh_key(&session.refresh_token))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn update_expiry(
        &self,
        session_id: Uuid,
        new_expiry: DateTime<Utc>,
    ) -> SessionResult<()> {
        if new_expiry <= Utc::now() {
            return Err(SessionError::InvalidExpiry);
        }
        let mut session = self.get(session_id).await?;
        session.expires_at = new_expiry;
        self.store(&session).await
    }
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, Session>,
    refresh: HashMap<String, Uuid>,
}

impl MemoryState {
    /// Inserts or replaces a session, dropping the refresh mapping of the
    /// session it replaces.
    fn put(&mut self, session: Session) {
        if let Some(previous) = self.sessions.get(&session.id) {
            if previous.refresh_token != session.refresh_token {
                self.refresh.remove(&previous.refresh_token);
            }
        }
        self.refresh.insert(session.refresh_token.clone(), session.id);
        self.sessions.insert(session.id, session);
    }
}

/// Process-local cache. Entries are never evicted on their own, so readers
/// must check `expires_at` themselves.
#[derive(Default)]
pub struct MemorySessionCache {
    state: RwLock<MemoryState>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrites a stored session without TTL checks, so callers can
    /// simulate a session that expired while still cached.
    pub async fn force_insert(&self, session: Session) {
        self.state.write().await.put(session);
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn store(&self, session: &Session) -> SessionResult<()> {
        ttl_millis(session.expires_at, Utc::now())?;
        self.state.write().await.put(session.clone());
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> SessionResult<Session> {
        let state = self.state.read().await;
        state
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    async fn get_by_refresh(&self, refresh_token: &str) -> SessionResult<Session> {
        let state = self.state.read().await;
        state
            .refresh
            .get(refresh_token)
            .and_then(|id| state.sessions.get(id))
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    async fn delete(&self, session_id: Uuid) -> SessionResult<()> {
        let mut state = self.state.write().await;
        if let Some(session) = state.sessions.remove(&session_id) {
            state.refresh.remove(&session.refresh_token);
        }
        Ok(())
    }

    async fn update_expiry(
        &self,
        session_id: Uuid,
        new_expiry: DateTime<Utc>,
    ) -> SessionResult<()> {
        if new_expiry <= Utc::now() {
            return Err(SessionError::InvalidExpiry);
        }
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::NotFound)?;
        session.expires_at = new_expiry;
        Ok(())
    }
}

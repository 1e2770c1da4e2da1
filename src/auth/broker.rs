//! Binds external identities to local users and owns the session lifecycle.

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    auth::{
        identity::{ExternalGuild, IdentityError, IdentityProvider},
        jwt::{Claims, TokenCodec, TokenError, TokenKind},
        session::{Session, SessionCache, SessionError},
        AuthenticatedUser,
    },
    error::{AppError, ErrorCode},
    models::{NewUser, User},
    store::{Store, StoreError},
};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("identity provider error: {0}")]
    Provider(#[from] IdentityError),
    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("user not found")]
    UserNotFound,
    #[error("no provider access token in session")]
    ProviderTokenMissing,
    #[error("session cache error: {0}")]
    Session(SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SessionError> for BrokerError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::NotFound => BrokerError::SessionNotFound,
            SessionError::AlreadyExpired => BrokerError::SessionExpired,
            other => BrokerError::Session(other),
        }
    }
}

impl BrokerError {
    /// Failures that mean the presented credential is no good, as opposed to
    /// a dependency being down.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            BrokerError::InvalidToken(_)
                | BrokerError::SessionNotFound
                | BrokerError::SessionExpired
                | BrokerError::UserNotFound
        )
    }
}

impl From<BrokerError> for AppError {
    fn from(value: BrokerError) -> Self {
        match value {
            BrokerError::Provider(err) => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::DiscordApiError,
                "Failed to communicate with Discord",
            )
            .with_details(json!({ "error": err.to_string() })),
            BrokerError::ProviderTokenMissing => AppError::new(
                StatusCode::UNAUTHORIZED,
                ErrorCode::DiscordTokenMissing,
                "Discord access token not found in session. Please log in again.",
            ),
            err if err.is_authentication() => AppError::unauthorized("Invalid or expired token")
                .with_details(json!({ "error": err.to_string() })),
            err => AppError::internal(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub id: Uuid,
    pub external_user_id: String,
    pub display_name: String,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            external_user_id: user.external_user_id.clone(),
            display_name: user.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user: UserView,
}

pub struct IdentityBroker {
    codec: TokenCodec,
    sessions: Arc<dyn SessionCache>,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn Store>,
}

impl IdentityBroker {
    pub fn new(
        codec: TokenCodec,
        sessions: Arc<dyn SessionCache>,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            codec,
            sessions,
            provider,
            store,
        }
    }

    pub fn login_url(&self, state: &str) -> String {
        self.provider.auth_url(state)
    }

    /// Exchanges the authorization code and opens a session. The session is
    /// stored last, so nothing is visible to `validate` unless this returns
    /// `Ok`.
    pub async fn complete_login(&self, code: &str) -> Result<AuthResponse, BrokerError> {
        let provider_tokens = self.provider.exchange(code).await?;
        let profile = self.provider.user_info(&provider_tokens.access_token).await?;

        let user = self
            .store
            .upsert_user(NewUser {
                external_user_id: profile.id.clone(),
                display_name: profile.display_name().to_string(),
                avatar: profile.avatar.clone(),
                email: profile.email.clone(),
            })
            .await?;

        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let access = self.codec.mint_user_access_at(&user, session_id, now)?;
        let refresh = self.codec.mint_user_refresh_at(&user, session_id, now)?;

        let session = Session {
            id: session_id,
            user_id: user.id,
            access_token: access.token.clone(),
            refresh_token: refresh.token.clone(),
            expires_at: refresh.expires_at,
            created_at: now,
            provider_access_token: Some(provider_tokens.access_token),
            provider_refresh_token: provider_tokens.refresh_token,
        };
        self.sessions.store(&session).await?;

        tracing::info!(user_id = %user.id, session_id = %session_id, "user logged in");

        Ok(AuthResponse {
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in: self.codec.access_ttl().num_seconds(),
            user: UserView::from(&user),
        })
    }

    /// Mints a new access token for the session behind `refresh_token`. The
    /// refresh token itself does not rotate.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, BrokerError> {
        let claims = self.codec.verify_kind(refresh_token, TokenKind::Refresh)?;
        let mut session = self.sessions.get_by_refresh(refresh_token).await?;
        if claims.session_id != Some(session.id) {
            return Err(BrokerError::SessionNotFound);
        }

        let now = Utc::now();
        if session.is_expired_at(now) {
            self.evict(session.id).await;
            return Err(BrokerError::SessionExpired);
        }

        let user = self
            .store
            .get_user(session.user_id)
            .await?
            .ok_or(BrokerError::UserNotFound)?;

        let access = self.codec.mint_user_access_at(&user, session.id, now)?;
        session.access_token = access.token.clone();
        self.sessions.store(&session).await?;

        Ok(AuthResponse {
            access_token: access.token,
            refresh_token: session.refresh_token,
            expires_in: self.codec.access_ttl().num_seconds(),
            user: UserView::from(&user),
        })
    }

    /// Resolves an access token to the caller. The projection comes from the
    /// token claims; the user table is not consulted.
    pub async fn validate(&self, access_token: &str) -> Result<AuthenticatedUser, BrokerError> {
        let claims = self.codec.verify_kind(access_token, TokenKind::Access)?;
        let session_id = claims.session_id.ok_or(TokenError::Malformed)?;
        let session = self.sessions.get(session_id).await?;

        if session.is_expired_at(Utc::now()) {
            self.evict(session_id).await;
            return Err(BrokerError::SessionExpired);
        }

        authenticated_from_claims(&claims, session_id)
    }

    /// Deletes the session behind `access_token`. Logging out twice succeeds.
    pub async fn logout(&self, access_token: &str) -> Result<(), BrokerError> {
        let claims = self.codec.verify_kind(access_token, TokenKind::Access)?;
        let session_id = claims.session_id.ok_or(TokenError::Malformed)?;
        self.sessions.delete(session_id).await?;
        tracing::info!(session_id = %session_id, "session closed");
        Ok(())
    }

    /// Guilds of the session's user, fetched with the provider token stored
    /// at login.
    pub async fn list_guilds(&self, session_id: Uuid) -> Result<Vec<ExternalGuild>, BrokerError> {
        let session = self.sessions.get(session_id).await?;
        let token = session
            .provider_access_token
            .filter(|token| !token.is_empty())
            .ok_or(BrokerError::ProviderTokenMissing)?;
        Ok(self.provider.list_guilds(&token).await?)
    }

    async fn evict(&self, session_id: Uuid) {
        if let Err(err) = self.sessions.delete(session_id).await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to evict expired session");
        }
    }
}

fn authenticated_from_claims(
    claims: &Claims,
    session_id: Uuid,
) -> Result<AuthenticatedUser, BrokerError> {
    let user_id = match claims.user_id {
        Some(id) => id,
        None => Uuid::parse_str(&claims.sub).map_err(|_| TokenError::Malformed)?,
    };
    Ok(AuthenticatedUser {
        user_id,
        external_user_id: claims.external_user_id.clone().unwrap_or_default(),
        display_name: claims.display_name.clone().unwrap_or_default(),
        session_id,
    })
}

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{config::AppConfig, models::User};

const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
    Controller,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
    #[error("token uses an unexpected signing algorithm")]
    WrongAlgorithm,
    #[error("token issuer is not trusted")]
    InvalidIssuer,
    #[error("token is of the wrong type")]
    WrongKind,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        match value.kind() {
            ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::ImmatureSignature => TokenError::NotYetValid,
            ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::InvalidKeyFormat => TokenError::WrongAlgorithm,
            ErrorKind::InvalidIssuer => TokenError::InvalidIssuer,
            _ => TokenError::Malformed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies HS256 bearer tokens with one process-wide key.
#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    controller_ttl: Duration,
}

impl TokenCodec {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            &config.jwt_issuer,
            config.access_token_ttl,
            config.refresh_token_ttl,
            config.controller_token_ttl,
        )
    }

    pub fn new(
        secret: &[u8],
        issuer: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
        controller_ttl: Duration,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.to_owned(),
            access_ttl,
            refresh_ttl,
            controller_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn mint_user_access(
        &self,
        user: &User,
        session_id: Uuid,
    ) -> Result<MintedToken, TokenError> {
        self.mint_user_access_at(user, session_id, Utc::now())
    }

    pub fn mint_user_access_at(
        &self,
        user: &User,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<MintedToken, TokenError> {
        self.mint_user(TokenKind::Access, user, session_id, now, self.access_ttl)
    }

    pub fn mint_user_refresh(
        &self,
        user: &User,
        session_id: Uuid,
    ) -> Result<MintedToken, TokenError> {
        self.mint_user_refresh_at(user, session_id, Utc::now())
    }

    pub fn mint_user_refresh_at(
        &self,
        user: &User,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<MintedToken, TokenError> {
        self.mint_user(TokenKind::Refresh, user, session_id, now, self.refresh_ttl)
    }

    pub fn mint_controller(
        &self,
        controller_id: Uuid,
        cluster_id: &str,
    ) -> Result<MintedToken, TokenError> {
        self.mint_controller_at(controller_id, cluster_id, Utc::now())
    }

    pub fn mint_controller_at(
        &self,
        controller_id: Uuid,
        cluster_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MintedToken, TokenError> {
        let expires_at = now + self.controller_ttl;
        let claims = Claims {
            sub: controller_id.to_string(),
            kind: TokenKind::Controller,
            session_id: None,
            cluster_id: Some(cluster_id.to_owned()),
            user_id: None,
            external_user_id: None,
            display_name: None,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        self.sign(&claims, expires_at)
    }

    /// Verifies signature, algorithm, issuer, and the time window. Never performs I/O.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_issuer(&[self.issuer.clone()]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }

    pub fn verify_kind(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.kind != kind {
            return Err(TokenError::WrongKind);
        }
        Ok(claims)
    }

    fn mint_user(
        &self,
        kind: TokenKind,
        user: &User,
        session_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<MintedToken, TokenError> {
        let expires_at = now + ttl;
        let claims = Claims {
            sub: user.id.to_string(),
            kind,
            session_id: Some(session_id),
            cluster_id: None,
            user_id: Some(user.id),
            external_user_id: Some(user.external_user_id.clone()),
            display_name: Some(user.display_name.clone()),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        self.sign(&claims, expires_at)
    }

    fn sign(&self, claims: &Claims, expires_at: DateTime<Utc>) -> Result<MintedToken, TokenError> {
        let token = encode(&Header::new(SIGNING_ALGORITHM), claims, &self.encoding)
            .map_err(|err| TokenError::Signing(err.to_string()))?;
        Ok(MintedToken { token, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(
            b"unit-test-secret",
            "guildhost-test",
            Duration::hours(1),
            Duration::days(7),
            Duration::days(30),
        )
    }

    fn user() -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            external_user_id: "80351110224678912".into(),
            display_name: "nelly".into(),
            avatar: None,
            email: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn access_token_round_trips_user_claims() {
        let codec = codec();
        let user = user();
        let session_id = Uuid::new_v4();
        let minted = codec.mint_user_access(&user, session_id).unwrap();
        let claims = codec.verify(&minted.token).unwrap();

        assert_eq!(claims.kind, TokenKind::Access);
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.session_id, Some(session_id));
        assert_eq!(claims.user_id, Some(user.id));
        assert_eq!(claims.external_user_id.as_deref(), Some("80351110224678912"));
        assert_eq!(claims.display_name.as_deref(), Some("nelly"));
        assert_eq!(claims.iss, "guildhost-test");
        assert_eq!(claims.exp - claims.iat, 3600);
        assert_eq!(claims.expires_at().timestamp(), minted.expires_at.timestamp());
    }

    #[test]
    fn refresh_and_controller_ttls_follow_configuration() {
        let codec = codec();
        let refresh = codec.mint_user_refresh(&user(), Uuid::new_v4()).unwrap();
        let claims = codec.verify(&refresh.token).unwrap();
        assert_eq!(claims.kind, TokenKind::Refresh);
        assert_eq!(claims.exp - claims.iat, 7 * 24 * 3600);

        let controller_id = Uuid::new_v4();
        let minted = codec.mint_controller(controller_id, "c1").unwrap();
        let claims = codec.verify(&minted.token).unwrap();
        assert_eq!(claims.kind, TokenKind::Controller);
        assert_eq!(claims.sub, controller_id.to_string());
        assert_eq!(claims.cluster_id.as_deref(), Some("c1"));
        assert_eq!(claims.session_id, None);
        assert_eq!(claims.exp - claims.iat, 30 * 24 * 3600);
    }

    #[test]
    fn rejects_expired_tokens() {
        let codec = codec();
        let issued = Utc::now() - Duration::hours(2);
        let minted = codec
            .mint_user_access_at(&user(), Uuid::new_v4(), issued)
            .unwrap();
        assert_eq!(codec.verify(&minted.token), Err(TokenError::Expired));
    }

    #[test]
    fn rejects_tokens_not_yet_valid() {
        let codec = codec();
        let issued = Utc::now() + Duration::minutes(5);
        let minted = codec
            .mint_user_access_at(&user(), Uuid::new_v4(), issued)
            .unwrap();
        assert_eq!(codec.verify(&minted.token), Err(TokenError::NotYetValid));
    }

    #[test]
    fn rejects_foreign_key_and_issuer() {
        let minted = codec().mint_user_access(&user(), Uuid::new_v4()).unwrap();

        let other_key = TokenCodec::new(
            b"another-secret",
            "guildhost-test",
            Duration::hours(1),
            Duration::days(7),
            Duration::days(30),
        );
        assert_eq!(other_key.verify(&minted.token), Err(TokenError::InvalidSignature));

        let other_issuer = TokenCodec::new(
            b"unit-test-secret",
            "someone-else",
            Duration::hours(1),
            Duration::days(7),
            Duration::days(30),
        );
        assert_eq!(other_issuer.verify(&minted.token), Err(TokenError::InvalidIssuer));
    }

    #[test]
    fn rejects_unexpected_signing_family() {
        let codec = codec();
        let now = Utc::now();
        let claims = Claims {
            sub: "x".into(),
            kind: TokenKind::Access,
            session_id: None,
            cluster_id: None,
            user_id: None,
            external_user_id: None,
            display_name: None,
            iss: "guildhost-test".into(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"unit-test-secret"),
        )
        .unwrap();
        assert_eq!(codec.verify(&token), Err(TokenError::WrongAlgorithm));

        let unsigned = {
            let mut parts = token.split('.');
            let _header = parts.next();
            let payload = parts.next().unwrap();
            // {"alg":"none","typ":"JWT"}
            format!("eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0.{payload}.")
        };
        assert!(codec.verify(&unsigned).is_err());
    }

    #[test]
    fn any_single_bit_flip_invalidates_the_token() {
        let codec = codec();
        let minted = codec.mint_user_access(&user(), Uuid::new_v4()).unwrap();
        let bytes = minted.token.as_bytes();

        for index in 0..bytes.len() {
            for bit in 0..8 {
                let mut mutated = bytes.to_vec();
                mutated[index] ^= 1 << bit;
                let Ok(candidate) = String::from_utf8(mutated) else {
                    continue;
                };
                assert!(
                    codec.verify(&candidate).is_err(),
                    "flip of bit {bit} at byte {index} still verified"
                );
            }
        }
    }

    #[test]
    fn verify_kind_rejects_other_token_types() {
        let codec = codec();
        let refresh = codec.mint_user_refresh(&user(), Uuid::new_v4()).unwrap();
        assert_eq!(
            codec.verify_kind(&refresh.token, TokenKind::Access),
            Err(TokenError::WrongKind)
        );
        assert!(codec.verify_kind(&refresh.token, TokenKind::Refresh).is_ok());
    }
}

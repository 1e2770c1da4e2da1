//! External identity provider contract and its Discord implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::DiscordConfig;

const AUTHORIZE_URL: &str = "https://discord.com/api/oauth2/authorize";
const TOKEN_URL: &str = "https://discord.com/api/oauth2/token";
const OAUTH_SCOPES: &str = "identify email guilds";
const MANAGE_GUILD: u64 = 0x20;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity provider request failed: {0}")]
    Request(String),
    #[error("identity provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("bot token is not configured")]
    MissingBotToken,
}

impl From<reqwest::Error> for IdentityError {
    fn from(value: reqwest::Error) -> Self {
        IdentityError::Request(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl ExternalUser {
    pub fn display_name(&self) -> &str {
        self.global_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalGuild {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner: bool,
    /// Decimal bit-field, as sent by the provider.
    #[serde(default)]
    pub permissions: String,
}

impl ExternalGuild {
    /// Owners and holders of MANAGE_GUILD may install into the guild.
    pub fn can_install(&self) -> bool {
        self.owner
            || self
                .permissions
                .parse::<u64>()
                .map(|bits| bits & MANAGE_GUILD == MANAGE_GUILD)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRole {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: i32,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub mentionable: bool,
    #[serde(default)]
    pub hoist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalMember {
    #[serde(default)]
    pub user: Option<ExternalUser>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn auth_url(&self, state: &str) -> String;
    async fn exchange(&self, code: &str) -> Result<ProviderTokens, IdentityError>;
    async fn user_info(&self, access_token: &str) -> Result<ExternalUser, IdentityError>;
    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, IdentityError>;
    async fn list_guilds(&self, access_token: &str) -> Result<Vec<ExternalGuild>, IdentityError>;
    /// Uses the configured bot credential.
    async fn list_roles(&self, guild_id: &str) -> Result<Vec<ExternalRole>, IdentityError>;
    /// Uses the configured bot credential.
    async fn list_members(
        &self,
        guild_id: &str,
        limit: u32,
    ) -> Result<Vec<ExternalMember>, IdentityError>;
}

pub struct DiscordClient {
    http: reqwest::Client,
    config: DiscordConfig,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, config })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<ProviderTokens, IdentityError> {
        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        params.extend_from_slice(form);
        let response = self.http.post(TOKEN_URL).form(&params).send().await?;
        decode(response).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        authorization: String,
    ) -> Result<T, IdentityError> {
        let url = format!("{}{}", self.config.api_base, path);
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await?;
        decode(response).await
    }

    fn bot_authorization(&self) -> Result<String, IdentityError> {
        self.config
            .bot_token
            .as_deref()
            .map(|token| format!("Bot {token}"))
            .ok_or(IdentityError::MissingBotToken)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, IdentityError> {
    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(IdentityError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<T>().await?)
}

#[async_trait]
impl IdentityProvider for DiscordClient {
    fn auth_url(&self, state: &str) -> String {
        let mut url = match Url::parse(AUTHORIZE_URL) {
            Ok(url) => url,
            Err(_) => return AUTHORIZE_URL.to_string(),
        };
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", OAUTH_SCOPES)
            .append_pair("state", state);
        url.to_string()
    }

    async fn exchange(&self, code: &str) -> Result<ProviderTokens, IdentityError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_url.as_str()),
        ])
        .await
    }

    async fn user_info(&self, access_token: &str) -> Result<ExternalUser, IdentityError> {
        self.get_json("/users/@me", format!("Bearer {access_token}"))
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, IdentityError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn list_guilds(&self, access_token: &str) -> Result<Vec<ExternalGuild>, IdentityError> {
        self.get_json("/users/@me/guilds", format!("Bearer {access_token}"))
            .await
    }

    async fn list_roles(&self, guild_id: &str) -> Result<Vec<ExternalRole>, IdentityError> {
        let authorization = self.bot_authorization()?;
        self.get_json(&format!("/guilds/{guild_id}/roles"), authorization)
            .await
    }

    async fn list_members(
        &self,
        guild_id: &str,
        limit: u32,
    ) -> Result<Vec<ExternalMember>, IdentityError> {
        let authorization = self.bot_authorization()?;
        let limit = limit.clamp(1, 1000);
        self.get_json(
            &format!("/guilds/{guild_id}/members?limit={limit}"),
            authorization,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guild(owner: bool, permissions: &str) -> ExternalGuild {
        ExternalGuild {
            id: "1".into(),
            name: "g".into(),
            icon: None,
            owner,
            permissions: permissions.into(),
        }
    }

    #[test]
    fn can_install_requires_owner_or_manage_guild() {
        assert!(guild(true, "0").can_install());
        assert!(guild(false, "32").can_install());
        assert!(guild(false, "2147483679").can_install());
        assert!(!guild(false, "8").can_install());
        assert!(!guild(false, "not-a-number").can_install());
    }

    #[test]
    fn auth_url_embeds_state_and_scopes() {
        let client = DiscordClient::new(DiscordConfig {
            client_id: "client-1".into(),
            client_secret: "secret".into(),
            redirect_url: "http://localhost:8080/auth/callback".into(),
            bot_token: None,
            api_base: "https://discord.com/api/v10".into(),
        })
        .unwrap();
        let url = Url::parse(&client.auth_url("state-123")).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("discord.com"));
        assert!(pairs.contains(&("state".into(), "state-123".into())));
        assert!(pairs.contains(&("client_id".into(), "client-1".into())));
        assert!(pairs.contains(&("scope".into(), "identify email guilds".into())));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
    }

    #[test]
    fn display_name_prefers_global_name() {
        let mut user = ExternalUser {
            id: "1".into(),
            username: "handle".into(),
            global_name: Some("Pretty".into()),
            avatar: None,
            email: None,
        };
        assert_eq!(user.display_name(), "Pretty");
        user.global_name = Some(String::new());
        assert_eq!(user.display_name(), "handle");
    }
}

use std::env;

use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

pub const ACCESS_TOKEN_TTL_MINUTES: i64 = 60;
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 7;
pub const CONTROLLER_TOKEN_TTL_DAYS: i64 = 30;
pub const HEARTBEAT_TTL_SECONDS: i64 = 300;
pub const MAX_HEARTBEAT_AGE_SECONDS: i64 = 600;
pub const OAUTH_STATE_TTL_MINUTES: i64 = 10;

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Clone, Debug)]
pub struct DiscordConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub bot_token: Option<String>,
    pub api_base: String,
}

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    pub fn url(&self) -> Result<String> {
        let mut url = Url::parse(&format!("redis://{}:{}/{}", self.host, self.port, self.db))
            .context("REDIS_HOST must form a valid redis url")?;
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|_| anyhow!("REDIS_PASSWORD cannot be encoded into the redis url"))?;
        }
        Ok(url.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub environment: String,
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub discord: DiscordConfig,
    pub redis: RedisConfig,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub controller_token_ttl: Duration,
    pub controller_handshake_secret: Option<String>,
    /// Refuse handshakes without a signature when a secret is configured.
    pub require_signed_handshake: bool,
    pub heartbeat_ttl: Duration,
    pub max_heartbeat_age: Duration,
    pub super_admin_discord_id: Option<String>,
    pub frontend_url: String,
    pub additional_cors_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let server_host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT must be a valid u16")?;
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let database_url = match env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => compose_database_url()?,
        };
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);

        let discord = DiscordConfig {
            client_id: env::var("DISCORD_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("DISCORD_CLIENT_SECRET").unwrap_or_default(),
            redirect_url: env::var("DISCORD_REDIRECT_URL")
                .unwrap_or_else(|_| "http://localhost:8080/auth/callback".to_string()),
            bot_token: non_empty_var("DISCORD_BOT_TOKEN"),
            api_base: DISCORD_API_BASE.to_string(),
        };

        let redis = RedisConfig {
            host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("REDIS_PORT")
                .unwrap_or_else(|_| "6379".to_string())
                .parse()
                .context("REDIS_PORT must be a valid u16")?,
            password: non_empty_var("REDIS_PASSWORD"),
            db: env::var("REDIS_DB")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("REDIS_DB must be an integer")?,
        };

        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "guildhost".to_string());

        let frontend_url =
            env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
        let additional_cors_origins = env::var("ADDITIONAL_CORS_ORIGINS")
            .map(|raw| split_origins(&raw))
            .unwrap_or_default();

        Ok(Self {
            server_host,
            server_port,
            environment,
            database_url,
            database_max_pool_size,
            discord,
            redis,
            jwt_secret,
            jwt_issuer,
            access_token_ttl: Duration::minutes(ACCESS_TOKEN_TTL_MINUTES),
            refresh_token_ttl: Duration::days(REFRESH_TOKEN_TTL_DAYS),
            controller_token_ttl: Duration::days(CONTROLLER_TOKEN_TTL_DAYS),
            controller_handshake_secret: non_empty_var("CONTROLLER_HANDSHAKE_SECRET"),
            require_signed_handshake: env::var("REQUIRE_SIGNED_HANDSHAKE")
                .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
                .unwrap_or(false),
            heartbeat_ttl: Duration::seconds(HEARTBEAT_TTL_SECONDS),
            max_heartbeat_age: Duration::seconds(MAX_HEARTBEAT_AGE_SECONDS),
            super_admin_discord_id: non_empty_var("SUPER_ADMIN_DISCORD_ID"),
            frontend_url,
            additional_cors_origins,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn default_log_filter(&self) -> &'static str {
        if self.is_production() {
            "info"
        } else {
            "debug"
        }
    }

    pub fn cors_origins(&self) -> Vec<String> {
        let mut origins = vec![self.frontend_url.clone()];
        for origin in &self.additional_cors_origins {
            if !origins.contains(origin) {
                origins.push(origin.clone());
            }
        }
        origins
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

/// Settings for the remote cluster agent binary.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub backend_url: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub version: String,
    pub health_port: u16,
    pub handshake_secret: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            backend_url: env::var("BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            cluster_id: env::var("CLUSTER_ID").unwrap_or_else(|_| "default-cluster".to_string()),
            cluster_name: env::var("CLUSTER_NAME")
                .unwrap_or_else(|_| "Default Cluster".to_string()),
            version: env::var("CONTROLLER_VERSION").unwrap_or_else(|_| "0.1.0".to_string()),
            health_port: env::var("AGENT_HEALTH_PORT")
                .unwrap_or_else(|_| "8081".to_string())
                .parse()
                .context("AGENT_HEALTH_PORT must be a valid u16")?,
            handshake_secret: non_empty_var("CONTROLLER_HANDSHAKE_SECRET"),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn compose_database_url() -> Result<String> {
    let host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("DB_PASSWORD").unwrap_or_default();
    let name = env::var("DB_NAME").unwrap_or_else(|_| "guildhost".to_string());
    let sslmode = env::var("DB_SSLMODE").unwrap_or_else(|_| "disable".to_string());
    build_database_url(&host, &port, &user, &password, &name, &sslmode)
}

fn build_database_url(
    host: &str,
    port: &str,
    user: &str,
    password: &str,
    name: &str,
    sslmode: &str,
) -> Result<String> {
    let mut url = Url::parse(&format!("postgres://{host}:{port}/{name}"))
        .context("DB_HOST, DB_PORT and DB_NAME must form a valid url")?;
    url.set_username(user)
        .map_err(|_| anyhow!("DB_USER cannot be encoded into the database url"))?;
    if !password.is_empty() {
        url.set_password(Some(password))
            .map_err(|_| anyhow!("DB_PASSWORD cannot be encoded into the database url"))?;
    }
    url.query_pairs_mut().append_pair("sslmode", sslmode);
    Ok(url.to_string())
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

use std::env;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::Duration;
use diesel::connection::SimpleConnection;
use guildhost::auth::identity::{
    ExternalGuild, ExternalMember, ExternalRole, ExternalUser, IdentityError, IdentityProvider,
    ProviderTokens,
};
use guildhost::auth::session::MemorySessionCache;
use guildhost::config::{AppConfig, DiscordConfig, RedisConfig, DISCORD_API_BASE};
use guildhost::db::{self, PgPool};
use guildhost::models::{NewMembership, NewTenant, NewTenantRole, Tenant};
use guildhost::routes;
use guildhost::state::AppState;
use guildhost::store::{MemoryStore, PgStore, Store};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub const SUPER_ADMIN_LOGIN: &str = "root";

/// Identity provider that derives everything from the authorization code:
/// code `alice` logs in external user `discord-alice`. Codes starting with
/// `bad` fail the exchange.
#[derive(Default)]
pub struct FakeIdentityProvider {
    guilds: Vec<ExternalGuild>,
}

impl FakeIdentityProvider {
    #[allow(dead_code)]
    pub fn with_guilds(guilds: Vec<ExternalGuild>) -> Self {
        Self { guilds }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    fn auth_url(&self, state: &str) -> String {
        format!("https://idp.test/oauth2/authorize?state={state}")
    }

    async fn exchange(&self, code: &str) -> Result<ProviderTokens, IdentityError> {
        if code.starts_with("bad") {
            return Err(IdentityError::Status {
                status: 400,
                body: "invalid_grant".to_string(),
            });
        }
        Ok(ProviderTokens {
            access_token: format!("idp-{code}"),
            refresh_token: Some(format!("idp-refresh-{code}")),
            expires_in: 604_800,
        })
    }

    async fn user_info(&self, access_token: &str) -> Result<ExternalUser, IdentityError> {
        let name = access_token
            .strip_prefix("idp-")
            .ok_or_else(|| IdentityError::Request("unknown access token".to_string()))?;
        Ok(ExternalUser {
            id: external_id(name),
            username: name.to_string(),
            global_name: None,
            avatar: None,
            email: Some(format!("{name}@example.com")),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, IdentityError> {
        Ok(ProviderTokens {
            access_token: format!("idp-{refresh_token}"),
            refresh_token: Some(refresh_token.to_string()),
            expires_in: 604_800,
        })
    }

    async fn list_guilds(&self, _access_token: &str) -> Result<Vec<ExternalGuild>, IdentityError> {
        Ok(self.guilds.clone())
    }

    async fn list_roles(&self, _guild_id: &str) -> Result<Vec<ExternalRole>, IdentityError> {
        Ok(Vec::new())
    }

    async fn list_members(
        &self,
        _guild_id: &str,
        _limit: u32,
    ) -> Result<Vec<ExternalMember>, IdentityError> {
        Ok(Vec::new())
    }
}

pub fn external_id(login: &str) -> String {
    format!("discord-{login}")
}

pub fn test_config() -> AppConfig {
    AppConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        environment: "test".to_string(),
        database_url: "postgres://unused/guildhost".to_string(),
        database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
        discord: DiscordConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_url: "http://localhost:8080/auth/callback".to_string(),
            bot_token: None,
            api_base: DISCORD_API_BASE.to_string(),
        },
        redis: RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
        },
        jwt_secret: "test-secret".to_string(),
        jwt_issuer: "guildhost-test".to_string(),
        access_token_ttl: Duration::hours(1),
        refresh_token_ttl: Duration::days(7),
        controller_token_ttl: Duration::days(30),
        controller_handshake_secret: None,
        require_signed_handshake: false,
        heartbeat_ttl: Duration::seconds(300),
        max_heartbeat_age: Duration::seconds(600),
        super_admin_discord_id: Some(external_id(SUPER_ADMIN_LOGIN)),
        frontend_url: "http://localhost:3000".to_string(),
        additional_cors_origins: Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct LoggedIn {
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub sessions: Arc<MemorySessionCache>,
    router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(test_config(), FakeIdentityProvider::default())
    }

    pub fn build(config: AppConfig, provider: FakeIdentityProvider) -> Self {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(MemorySessionCache::new());
        let state = AppState::new(config, store.clone(), sessions.clone(), Arc::new(provider));
        let router = routes::create_router(state.clone());
        Self {
            state,
            store,
            sessions,
            router,
        }
    }

    /// Runs the full OAuth dance through the router.
    pub async fn login(&self, code: &str) -> Result<LoggedIn> {
        let response = self.get("/auth/login", None).await?;
        ensure!(response.status() == StatusCode::OK, "login start failed");
        let body = body_json(response.into_body()).await?;
        let state = body["state"]
            .as_str()
            .ok_or_else(|| anyhow!("login response carried no state"))?
            .to_string();

        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("/auth/callback?code={code}&state={state}"))
            .header(header::COOKIE, format!("oauth_state={state}"))
            .body(Body::empty())?;
        let response = self.send(request).await;
        ensure!(
            response.status() == StatusCode::OK,
            "callback failed with status {}",
            response.status()
        );
        let body = body_json(response.into_body()).await?;

        Ok(LoggedIn {
            user_id: body["user"]["id"]
                .as_str()
                .ok_or_else(|| anyhow!("callback response carried no user id"))?
                .parse()?,
            access_token: string_field(&body, "access_token")?,
            refresh_token: string_field(&body, "refresh_token")?,
        })
    }

    #[allow(dead_code)]
    pub async fn seed_tenant(&self, owner_user_id: Uuid, guild_id: &str) -> Result<Tenant> {
        Ok(self
            .store
            .create_tenant(NewTenant {
                id: Uuid::new_v4(),
                external_guild_id: guild_id.to_string(),
                name: format!("Guild {guild_id}"),
                icon: None,
                owner_user_id,
                config: serde_json::json!({}),
            })
            .await?)
    }

    #[allow(dead_code)]
    pub async fn seed_membership(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        roles: &[&str],
        permissions: &[&str],
    ) -> Result<()> {
        self.store
            .upsert_membership(NewMembership {
                id: Uuid::new_v4(),
                user_id,
                tenant_id,
                roles: roles.iter().map(|role| role.to_string()).collect(),
                permissions: permissions.iter().map(|perm| perm.to_string()).collect(),
            })
            .await?;
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn seed_guild_role(
        &self,
        tenant_id: Uuid,
        external_role_id: &str,
        permissions: &[&str],
    ) -> Result<()> {
        self.store
            .upsert_tenant_role(NewTenantRole {
                id: Uuid::new_v4(),
                tenant_id,
                external_role_id: external_role_id.to_string(),
                name: external_role_id.to_string(),
                color: 0,
                position: 0,
                permissions: permissions.iter().map(|perm| perm.to_string()).collect(),
                mentionable: false,
                hoisted: false,
            })
            .await?;
        Ok(())
    }

    /// Serves the router on an ephemeral local port and returns its base url.
    #[allow(dead_code)]
    pub async fn spawn_server(&self) -> Result<String> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = self.router.clone();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                eprintln!("test server failed: {err}");
            }
        });
        Ok(format!("http://{addr}"))
    }

    pub async fn send(&self, request: Request<Body>) -> hyper::Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response")
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.request(Method::GET, path, None::<&()>, token, None).await
    }

    #[allow(dead_code)]
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.request(Method::POST, path, Some(payload), token, None)
            .await
    }

    /// Sends a request scoped to `tenant` through the `X-Tenant-ID` header.
    #[allow(dead_code)]
    pub async fn tenant_request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&T>,
        token: &str,
        tenant: Uuid,
    ) -> Result<hyper::Response<Body>> {
        self.request(method, path, payload, Some(token), Some(tenant))
            .await
    }

    pub async fn request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&T>,
        token: Option<&str>,
        tenant: Option<Uuid>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        if let Some(tenant) = tenant {
            builder = builder.header("x-tenant-id", tenant.to_string());
        }
        let request = match payload {
            Some(payload) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(payload)?))?,
            None => builder.body(Body::empty())?,
        };
        Ok(self.send(request).await)
    }
}

fn string_field(body: &Value, key: &str) -> Result<String> {
    body[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("response carried no {key}"))
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_json(body: Body) -> Result<Value> {
    let bytes = body_to_vec(body).await?;
    serde_json::from_slice(&bytes).context("response body is not json")
}

#[allow(dead_code)]
pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

/// Postgres-backed store over `TEST_DATABASE_URL` with every table emptied,
/// or `None` when the variable is unset.
#[allow(dead_code)]
pub async fn pg_store() -> Result<Option<PgStore>> {
    let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
        return Ok(None);
    };
    let pool = db::init_pool(&database_url)?;
    db::run_migrations(&pool).await?;
    truncate_all(&pool).await?;
    Ok(Some(PgStore::new(pool)))
}

async fn truncate_all(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.batch_execute(
            "TRUNCATE TABLE audit_entries, controllers, internal_roles, tenant_roles, \
             memberships, tenants, users CASCADE;",
        )
        .context("failed to truncate tables")?;
        Ok(())
    })
    .await
    .context("truncate task panicked")?
}

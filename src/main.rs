use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower::make::Shared;
use tracing_subscriber::EnvFilter;

use guildhost::{
    auth::{identity::DiscordClient, session::RedisSessionCache},
    config::AppConfig,
    controllers::LivenessSweeper,
    db, routes,
    state::AppState,
    store::PgStore,
};

const REDIS_POOL_SIZE: usize = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(config.default_log_filter());
    tracing::info!(
        component = "server",
        environment = %config.environment,
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        redis_host = %config.redis.host,
        handshake_secret_configured = config.controller_handshake_secret.is_some(),
        require_signed_handshake = config.require_signed_handshake,
        "loaded backend configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(PgStore::new(pool));

    let sessions = RedisSessionCache::new(&config.redis.url()?, REDIS_POOL_SIZE)?;
    sessions
        .ping()
        .await
        .context("failed to reach the session cache")?;
    let provider = DiscordClient::new(config.discord.clone())?;

    let listen_addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("HOST and PORT must form a socket address")?;
    let sweep_interval = config
        .heartbeat_ttl
        .to_std()
        .context("heartbeat ttl must be positive")?;

    let state = AppState::new(config, store, Arc::new(sessions), Arc::new(provider));

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(
        LivenessSweeper::new(state.registry.clone(), sweep_interval).run(shutdown.clone()),
    );

    let router = routes::create_router(state);
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, Shared::new(router))
        .with_graceful_shutdown(async move {
            if let Err(err) = signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("server received shutdown signal");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        tracing::warn!(error = %err, "liveness sweeper task ended abnormally");
    }
    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

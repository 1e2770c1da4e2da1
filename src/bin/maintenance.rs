use std::{env, sync::Arc};

use anyhow::Result;
use chrono::Utc;
use tracing_subscriber::EnvFilter;

use guildhost::{
    auth::jwt::TokenCodec,
    config::AppConfig,
    controllers::{registry::SharedSecretVerifier, ControllerRegistry},
    db,
    store::PgStore,
};

const USAGE: &str = "Usage: maintenance <cleanup-controllers|mark-stale-controllers>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("cleanup-controllers") => cleanup_controllers().await?,
        Some("mark-stale-controllers") => mark_stale_controllers().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn registry() -> Result<ControllerRegistry> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = 1,
        "loaded backend configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;

    Ok(ControllerRegistry::new(
        Arc::new(PgStore::new(pool)),
        TokenCodec::from_config(&config),
        Box::new(
            SharedSecretVerifier::new(config.controller_handshake_secret.clone())
                .require_signature(config.require_signed_handshake),
        ),
        config.heartbeat_ttl,
        config.max_heartbeat_age,
    ))
}

async fn cleanup_controllers() -> Result<()> {
    let deleted = registry().await?.cleanup().await?;
    println!("Deleted {deleted} stale controllers.");
    Ok(())
}

async fn mark_stale_controllers() -> Result<()> {
    let marked = registry().await?.mark_stale_at(Utc::now()).await?;
    println!("Marked {marked} controllers inactive.");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

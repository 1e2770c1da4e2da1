use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower::make::Shared;
use tracing_subscriber::EnvFilter;

use guildhost::{
    agent::{health, BackendClient, HeartbeatLoop},
    config::AgentConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AgentConfig::from_env()?;
    tracing::info!(
        component = "agent",
        backend_url = %config.backend_url,
        cluster_id = %config.cluster_id,
        cluster_name = %config.cluster_name,
        version = %config.version,
        "loaded agent configuration"
    );

    let client = Arc::new(BackendClient::new(&config)?);
    tracing::info!("performing handshake with backend");
    let registration = client.handshake().await.context("handshake failed")?;
    tracing::info!(
        controller_id = %registration.controller_id,
        interval_secs = registration.heartbeat_interval.as_secs(),
        message = %registration.message,
        "handshake successful"
    );

    let shutdown = CancellationToken::new();
    let heartbeat = HeartbeatLoop::new(client.clone(), registration.heartbeat_interval);
    let heartbeat_task = heartbeat.start(shutdown.child_token());

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("serving health probes on {}", listen_addr);

    let router = health::router(client, config.version.clone());
    axum::serve(listener, Shared::new(router))
        .with_graceful_shutdown(async {
            if let Err(err) = signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("agent received shutdown signal");
        })
        .await?;

    heartbeat.stop();
    shutdown.cancel();
    if let Some(task) = heartbeat_task {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "heartbeat task ended abnormally");
        }
    }
    tracing::info!("agent exited");
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

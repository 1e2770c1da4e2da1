use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::registry::ControllerRegistry;

/// Periodically retires controllers that stopped reporting.
pub struct LivenessSweeper {
    registry: Arc<ControllerRegistry>,
    interval: Duration,
}

impl LivenessSweeper {
    pub fn new(registry: Arc<ControllerRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Runs until `shutdown` is cancelled. Failed sweeps are logged and
    /// retried on the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "liveness sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => {
                    info!("liveness sweeper shutting down");
                    return;
                }
            }

            match self.registry.sweep().await {
                Ok(report) => {
                    if report.marked_inactive > 0 || report.deleted > 0 {
                        info!(
                            marked_inactive = report.marked_inactive,
                            deleted = report.deleted,
                            "liveness sweep finished"
                        );
                    }
                }
                Err(err) => error!(error = %err, "liveness sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::jwt::TokenCodec,
        controllers::registry::SharedSecretVerifier,
        models::{ControllerStatus, NewController},
        store::{MemoryStore, Store},
    };
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_each_tick_and_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let stale = store
            .insert_controller(NewController {
                id: Uuid::new_v4(),
                cluster_id: "c1".into(),
                cluster_name: "C".into(),
                version: "1.0.0".into(),
                last_heartbeat: Utc::now() - chrono::Duration::minutes(15),
                status: ControllerStatus::Active,
                handshake_token: String::new(),
            })
            .await
            .unwrap();

        let registry = Arc::new(ControllerRegistry::new(
            store.clone(),
            TokenCodec::new(
                b"sweeper",
                "guildhost",
                chrono::Duration::hours(1),
                chrono::Duration::days(7),
                chrono::Duration::days(30),
            ),
            Box::new(SharedSecretVerifier::new(None)),
            chrono::Duration::seconds(300),
            chrono::Duration::seconds(600),
        ));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            LivenessSweeper::new(registry, Duration::from_secs(300)).run(shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_secs(301)).await;
        let swept = store.get_controller(stale.id).await.unwrap().unwrap();
        assert_eq!(swept.status, ControllerStatus::Inactive);

        shutdown.cancel();
        handle.await.unwrap();
    }
}

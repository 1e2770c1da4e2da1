//! Periodic liveness reporting from the agent side.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ControlPlaneClient;
use crate::{controllers::protocol::HeartbeatRequest, models::ControllerStatus};

const RUNNING_MESSAGE: &str = "Controller is running";

struct Inner {
    client: Arc<dyn ControlPlaneClient>,
    interval: Duration,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    stop: Mutex<CancellationToken>,
}

/// Sends one heartbeat immediately on start and then one per interval until
/// stopped or the parent token is cancelled. Send failures are logged and
/// never end the loop.
#[derive(Clone)]
pub struct HeartbeatLoop {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HeartbeatLoop {
    pub fn new(client: Arc<dyn ControlPlaneClient>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                interval,
                running: AtomicBool::new(false),
                started_at: Mutex::new(None),
                stop: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Time since the loop was started; zero before the first start.
    pub fn uptime(&self) -> Duration {
        lock(&self.inner.started_at)
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Spawns the loop. Returns `None` when it is already running.
    pub fn start(&self, ctx: CancellationToken) -> Option<JoinHandle<()>> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        *lock(&self.inner.started_at) = Some(Instant::now());
        let stop = {
            let mut guard = lock(&self.inner.stop);
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        info!(interval_secs = self.inner.interval.as_secs(), "heartbeat loop starting");
        let inner = self.inner.clone();
        Some(tokio::spawn(async move {
            run(&inner, ctx, stop).await;
            inner.running.store(false, Ordering::Release);
        }))
    }

    /// Signals the loop to exit. Calling it again, or before start, is a no-op.
    pub fn stop(&self) {
        let guard = lock(&self.inner.stop);
        if !guard.is_cancelled() && self.is_running() {
            info!("stopping heartbeat loop");
            guard.cancel();
        }
    }
}

async fn run(inner: &Inner, ctx: CancellationToken, stop: CancellationToken) {
    // The first tick of a tokio interval completes immediately.
    let mut ticker = tokio::time::interval(inner.interval);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                info!("heartbeat loop cancelled");
                return;
            }
            _ = stop.cancelled() => {
                info!("heartbeat loop stopped");
                return;
            }
            _ = ticker.tick() => send(inner).await,
        }
    }
}

async fn send(inner: &Inner) {
    let uptime = lock(&inner.started_at)
        .map(|started| started.elapsed())
        .unwrap_or_default();
    let report = HeartbeatRequest {
        status: ControllerStatus::Active,
        message: Some(RUNNING_MESSAGE.to_string()),
        metrics: HashMap::from([(
            "uptime_seconds".to_string(),
            uptime.as_secs().to_string(),
        )]),
        resources: HashMap::new(),
    };

    match inner.client.send_heartbeat(report).await {
        Ok(response) => debug!(
            uptime_secs = uptime.as_secs(),
            message = %response.message,
            "heartbeat sent"
        ),
        Err(err) => warn!(error = %err, "heartbeat failed"),
    }
}

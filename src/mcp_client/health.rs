//! Periodic liveness probes over connected servers.
//!
//! A probe is a `tools/list` request on the existing session with a short
//! timeout. A server that fails its probe is restarted; a restart that
//! exhausts its attempts is reported and the server stays disconnected
//! until the next pass.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::client::McpClient;

/// Outcome of probing one server.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub server: String,
    pub healthy: bool,
    /// Whether an unhealthy server was successfully restarted.
    pub restarted: bool,
    pub error: Option<String>,
}

/// Handle on the background health loop.
pub(crate) struct HealthMonitor {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Ask the loop to stop and wait for it.
    async fn stop(self) {
        let _ = self.stop.send(());
        // A pass in progress may be sleeping in a restart backoff.
        self.handle.abort();
        let _ = self.handle.await;
    }

    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}

impl McpClient {
    /// Probe a server's existing session. Never connects.
    pub async fn check_health(&self, name: &str) -> bool {
        let Some(session) = self.registry.session(name) else {
            return false;
        };
        let probe_timeout = self.settings.health_probe_timeout();
        match tokio::time::timeout(probe_timeout, session.list_tools()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(server = name, error = %e, "mcp: health probe failed");
                false
            }
            Err(_) => {
                tracing::warn!(server = name, timeout_ms = probe_timeout.as_millis() as u64, "mcp: health probe timed out");
                false
            }
        }
    }

    /// Probe every connected server once, restarting the unhealthy ones.
    pub async fn run_health_checks(&self) -> Vec<HealthReport> {
        let servers = self.registry.connected_servers();
        let checks = servers.iter().map(|name| async move {
            if self.check_health(name).await {
                return HealthReport {
                    server: name.clone(),
                    healthy: true,
                    restarted: false,
                    error: None,
                };
            }
            tracing::info!(server = %name, "mcp: restarting unhealthy server");
            match self.restart(name).await {
                Ok(_) => HealthReport {
                    server: name.clone(),
                    healthy: false,
                    restarted: true,
                    error: None,
                },
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "mcp: unhealthy server left disconnected");
                    HealthReport {
                        server: name.clone(),
                        healthy: false,
                        restarted: false,
                        error: Some(e.to_string()),
                    }
                }
            }
        });
        futures::future::join_all(checks).await
    }

    /// Start the background health loop, replacing any running one.
    ///
    /// The loop holds only a weak reference and ends on its own once the
    /// client is dropped; `cleanup` stops it explicitly.
    pub fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        let interval = interval.max(Duration::from_millis(10));
        let weak = Arc::downgrade(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                let Some(client) = weak.upgrade() else {
                    break;
                };
                let reports = client.run_health_checks().await;
                let unhealthy = reports.iter().filter(|r| !r.healthy).count();
                tracing::debug!(checked = reports.len(), unhealthy, "mcp: health pass complete");
            }
            tracing::debug!("mcp: health monitor stopped");
        });

        let previous = match self.health.lock() {
            Ok(mut slot) => slot.replace(HealthMonitor {
                stop: stop_tx,
                handle,
            }),
            Err(_) => {
                handle.abort();
                None
            }
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::info!(interval_ms = interval.as_millis() as u64, "mcp: health monitor started");
    }

    pub(super) async fn stop_health_monitor(&self) {
        let monitor = self.health.lock().ok().and_then(|mut slot| slot.take());
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }

    pub fn health_monitor_running(&self) -> bool {
        self.health
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|m| !m.handle.is_finished()))
            .unwrap_or(false)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Bounded, backoff-governed restart of one server's connection.
//!
//! A restart holds a permit from the client's restart gate for its whole
//! duration, so no more than `max_concurrent_restarts` servers respawn at
//! once. Tearing the old connection down is serialized across restarts;
//! the reconnection attempts that follow are not.

use std::sync::Arc;
use std::time::Duration;

use super::client::McpClient;
use super::errors::McpError;
use super::sessions::{next_session_id, Session};
use crate::events::Event;

/// Wait before retrying after the `attempt`-th failure: `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(cap, |delay| delay.min(cap))
}

impl McpClient {
    /// Replace a server's connection with a fresh one.
    ///
    /// Closes the current connection task (if any), waits for it to exit,
    /// then tries up to `max_restart_attempts` connections with exponential
    /// backoff between them. Fails with `RestartExhausted` when every
    /// attempt failed.
    ///
    /// A connection started after this call, e.g. by a concurrent restart,
    /// is already fresh and is kept.
    pub async fn restart(&self, name: &str) -> Result<Arc<Session>, McpError> {
        self.server_config(name)?;
        let requested_at = next_session_id();

        let _permit = self
            .restart_gate
            .acquire()
            .await
            .map_err(|_| McpError::ShuttingDown)?;

        {
            let _teardown = self.restart_lock.lock().await;
            if let Some(exited) = self.registry.request_close_older(name, requested_at) {
                tracing::info!(server = name, "mcp: restart closing current connection");
                exited.await;
            }
        }

        let max_attempts = self.settings.max_restart_attempts.max(1);
        let base = self.settings.backoff_base();
        let cap = self.settings.backoff_cap();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.get_session(name).await {
                Ok(session) => {
                    tracing::info!(server = name, attempt, session_id = session.id(), "mcp: restart succeeded");
                    self.events.emit(Event::RestartAttempt {
                        server: name.to_string(),
                        attempt,
                        success: true,
                        backoff_ms: 0,
                        error: None,
                    });
                    return Ok(session);
                }
                Err(McpError::ShuttingDown) => return Err(McpError::ShuttingDown),
                Err(e) => {
                    let backoff = if attempt < max_attempts {
                        backoff_delay(base, cap, attempt)
                    } else {
                        Duration::ZERO
                    };
                    let backoff_ms = backoff.as_millis() as u64;

                    if e.is_resource_exhausted() {
                        tracing::error!(
                            server = name,
                            attempt,
                            max_attempts,
                            backoff_ms,
                            error = %e,
                            "mcp: restart blocked by system resource exhaustion"
                        );
                    } else {
                        tracing::warn!(
                            server = name,
                            attempt,
                            max_attempts,
                            backoff_ms,
                            error = %e,
                            "mcp: restart attempt failed"
                        );
                    }
                    self.events.emit(Event::RestartAttempt {
                        server: name.to_string(),
                        attempt,
                        success: false,
                        backoff_ms,
                        error: Some(e.to_string()),
                    });

                    last_error = e.to_string();
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        tracing::error!(server = name, attempts = max_attempts, %last_error, "mcp: restart exhausted");
        Err(McpError::RestartExhausted {
            name: name.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Connection tasks: one per live server, sole owner of its transport.
//!
//! A connection task opens the channel, performs the `initialize`
//! handshake, publishes the session, then parks until either its close
//! signal fires or the channel dies. Teardown happens in the same task that
//! opened the channel; nothing else ever closes a transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::connector::{ChannelOwner, Connector, RpcChannel};
use super::errors::McpError;
use super::sessions::{Session, SessionRegistry};
use super::types::{initialize_params, InitializeResult, ServerConfig, SUPPORTED_PROTOCOL_VERSIONS};
use crate::events::{Event, EventSink};

/// Everything a connection task needs, moved into the task at spawn.
pub(crate) struct ConnectionTask {
    pub name: String,
    pub config: ServerConfig,
    pub generation: u64,
    pub connect_timeout: Duration,
    pub connector: Arc<dyn Connector>,
    pub registry: Arc<SessionRegistry>,
    pub events: Arc<dyn EventSink>,
}

/// Removes the task's registry slot when the task ends, even by panic.
struct SlotGuard {
    registry: Arc<SessionRegistry>,
    name: String,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.registry.release(&self.name, self.generation);
    }
}

impl ConnectionTask {
    /// Run the connection to completion.
    pub(crate) async fn run(
        self,
        publish: oneshot::Sender<Result<Arc<Session>, McpError>>,
        mut close: oneshot::Receiver<()>,
    ) {
        let guard = SlotGuard {
            registry: Arc::clone(&self.registry),
            name: self.name.clone(),
            generation: self.generation,
        };

        tracing::info!(server = %self.name, "mcp: connecting");

        let established = tokio::select! {
            biased;
            _ = &mut close => Err(McpError::InitFailed {
                name: self.name.clone(),
                reason: "close requested during handshake".into(),
            }),
            outcome = tokio::time::timeout(self.connect_timeout, self.establish()) => {
                outcome.unwrap_or_else(|_| Err(McpError::ConnectTimeout {
                    name: self.name.clone(),
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                }))
            }
        };

        let (session, mut owner) = match established {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(server = %self.name, error = %e, "mcp: connection failed");
                // Free the slot before waking waiters so a retry starts fresh.
                drop(guard);
                let _ = publish.send(Err(e));
                return;
            }
        };

        if !self.registry.publish(&self.name, self.generation, Arc::clone(&session)) {
            tracing::warn!(server = %self.name, "mcp: slot closed before publish, discarding session");
            owner.shutdown().await;
            drop(guard);
            let _ = publish.send(Err(McpError::InitFailed {
                name: self.name.clone(),
                reason: "connection closed before it was published".into(),
            }));
            return;
        }
        let _ = publish.send(Ok(Arc::clone(&session)));

        tracing::info!(
            server = %self.name,
            session_id = session.id(),
            protocol = session.protocol_version().unwrap_or("unknown"),
            "mcp: connected"
        );
        self.events.emit(Event::Connected {
            server: self.name.clone(),
            session_id: session.id(),
        });

        let reason = tokio::select! {
            _ = &mut close => "close requested".to_string(),
            reason = owner.closed() => reason,
        };

        self.registry.unpublish(&self.name, self.generation);
        owner.shutdown().await;

        tracing::info!(server = %self.name, session_id = session.id(), %reason, "mcp: disconnected");
        self.events.emit(Event::Disconnected {
            server: self.name.clone(),
            session_id: session.id(),
            reason,
        });
        drop(guard);
    }

    /// Open the channel and complete the handshake.
    async fn establish(&self) -> Result<(Arc<Session>, Box<dyn ChannelOwner>), McpError> {
        let connection = self.connector.connect(&self.name, &self.config).await?;
        let mut owner = connection.owner;

        match handshake(&self.name, connection.channel.as_ref()).await {
            Ok(init) => {
                let session = Session::new(
                    &self.name,
                    self.generation,
                    connection.channel,
                    init.server_info,
                    init.protocol_version,
                );
                Ok((Arc::new(session), owner))
            }
            Err(e) => {
                let context = owner.failure_context().await;
                owner.shutdown().await;
                let reason = match e {
                    McpError::InitFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                Err(McpError::InitFailed {
                    name: self.name.clone(),
                    reason: format!("{reason}{context}"),
                })
            }
        }
    }
}

/// Perform the MCP initialization handshake.
async fn handshake(name: &str, channel: &dyn RpcChannel) -> Result<InitializeResult, McpError> {
    let result = channel.request("initialize", Some(initialize_params())).await?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(version) = init.protocol_version.as_deref() {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("protocol mismatch: server speaks '{version}'"),
            });
        }
    }

    channel.notify("notifications/initialized", None).await?;
    Ok(init)
}

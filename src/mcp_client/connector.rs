//! Connection seam between the session manager and a concrete transport.
//!
//! A [`Connector`] opens one channel to a tool server and hands back two
//! halves: an [`RpcChannel`] that any task may use to issue requests, and a
//! [`ChannelOwner`] that only the connection task that opened it may hold.
//! The owner is the sole way to observe the channel dying and to close it.

use std::sync::Arc;

use async_trait::async_trait;

use super::errors::McpError;
use super::types::ServerConfig;

/// Request/notification half of an established channel. Shared by callers.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send a request and return its `result` (JSON-RPC errors become `ServerError`).
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError>;

    /// Send a notification; no reply is expected.
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError>;
}

/// Lifecycle half of an established channel. Owned by exactly one connection task.
#[async_trait]
pub trait ChannelOwner: Send {
    /// Resolve when the channel dies on its own, with a human-readable reason.
    async fn closed(&mut self) -> String;

    /// Diagnostic context (e.g. captured stderr) for a failed handshake.
    async fn failure_context(&mut self) -> String {
        String::new()
    }

    /// Tear the channel down.
    async fn shutdown(self: Box<Self>);
}

/// A freshly opened, not yet initialized channel.
pub struct Connection {
    pub channel: Arc<dyn RpcChannel>,
    pub owner: Box<dyn ChannelOwner>,
}

/// Opens channels to tool servers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, config: &ServerConfig) -> Result<Connection, McpError>;
}

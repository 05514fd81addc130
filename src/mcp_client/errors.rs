//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
///
/// `Clone` because a single connection failure resolves every caller that is
/// waiting on the same pending session.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The OS refused to spawn another process (EAGAIN / ENOMEM).
    #[error("resource exhausted while spawning server '{name}': {reason}")]
    ResourceExhausted { name: String, reason: String },

    /// The initialization handshake failed (bad reply, protocol mismatch, early exit).
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// The connection was not established within `connect_timeout`.
    #[error("connecting to server '{name}' timed out after {timeout_ms}ms")]
    ConnectTimeout { name: String, timeout_ms: u64 },

    /// The session's pipe closed mid-session (EOF, broken pipe, process exit).
    #[error("transport closed for server '{server}': {reason}")]
    TransportClosed { server: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// No configuration entry exists for the server.
    #[error("server '{name}' is not configured")]
    UnknownServer { name: String },

    /// The server is configured but disabled.
    #[error("server '{name}' is disabled")]
    ServerDisabled { name: String },

    /// Configuration error (missing env vars, bad config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts: {last_error}")]
    RestartExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },

    /// The client has been cleaned up and accepts no new sessions.
    #[error("MCP client is shutting down")]
    ShuttingDown,
}

impl McpError {
    /// Whether the session that produced this error is dead and must be replaced.
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, McpError::TransportClosed { .. })
    }

    /// Whether this error signals systemic process-table / memory pressure.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, McpError::ResourceExhausted { .. })
    }

    /// Whether retrying the same request unchanged may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            McpError::Timeout { .. }
                | McpError::ConnectTimeout { .. }
                | McpError::TransportClosed { .. }
                | McpError::TransportError { .. }
                | McpError::SpawnFailed { .. }
                | McpError::ResourceExhausted { .. }
                | McpError::InitFailed { .. }
        )
    }
}

/// Classify a process-spawn I/O error.
pub(crate) fn spawn_error(name: &str, err: &std::io::Error) -> McpError {
    use std::io::ErrorKind;

    // EAGAIN decodes to WouldBlock and ENOMEM to OutOfMemory.
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::OutOfMemory => McpError::ResourceExhausted {
            name: name.to_string(),
            reason: err.to_string(),
        },
        _ => McpError::SpawnFailed {
            name: name.to_string(),
            reason: err.to_string(),
        },
    }
}

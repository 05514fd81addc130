//! MCP Client: concurrent session manager for stdio tool servers.
//!
//! This module handles:
//! - Spawning tool-server child processes and speaking JSON-RPC 2.0 over stdio
//! - One connection task per server, the sole owner of its transport
//! - Idempotent session creation shared by concurrent callers
//! - Tool calls with one transparent reconnect on a dead pipe
//! - Health probes and bounded, backoff-governed restarts
//!
//! The execution engine reaches tool servers only through [`McpClient`].

pub mod client;
pub mod connector;
pub mod errors;
pub mod health;
pub mod intents;
pub mod lifecycle;
pub mod restart;
pub mod sessions;
mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{ManagerStatus, McpClient};
pub use connector::{ChannelOwner, Connection, Connector, RpcChannel};
pub use errors::McpError;
pub use health::HealthReport;
pub use intents::IntentMap;
pub use lifecycle::StdioConnector;
pub use sessions::Session;
pub use types::{
    IntentTarget, McpServersConfig, McpToolDefinition, ServerConfig, ToolCallResult, ToolErrorKind,
};

//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and server configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision announced in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Protocol revisions a server may answer with.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Client identity sent during the handshake.
pub const CLIENT_NAME: &str = "deskpilot";

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Build the `initialize` request parameters.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

// ─── Server Configuration ───────────────────────────────────────────────────

/// Static description of one tool server, from the servers file.
///
/// Immutable once loaded. The server's name is its key in [`McpServersConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Per-server connect timeout in seconds (overrides the global default).
    #[serde(default, alias = "connectTimeout")]
    pub connect_timeout: Option<f64>,
    /// Disabled servers are never supervised.
    #[serde(default)]
    pub disabled: bool,
    /// Human-readable role, shown in the catalog.
    #[serde(default)]
    pub description: Option<String>,
    /// `${VAR}` placeholders that could not be resolved at load time.
    #[serde(skip)]
    pub missing_env: Vec<String>,
}

impl ServerConfig {
    /// Effective connect timeout for this server.
    pub fn connect_timeout(&self, default: Duration) -> Duration {
        match self.connect_timeout {
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
            _ => default,
        }
    }
}

/// A logical tool intent resolved to a concrete server method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentTarget {
    pub server: String,
    pub tool: String,
}

/// Top-level servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(alias = "mcpServers")]
    pub servers: HashMap<String, ServerConfig>,
    /// Static `intent → (server, tool)` table.
    #[serde(default)]
    pub intents: HashMap<String, IntentTarget>,
}

// ─── Tool Call Results ──────────────────────────────────────────────────────

/// Failure category of a tool call, used by the executor's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Could not obtain a session (spawn / handshake failure).
    Connection,
    /// The call or the connect attempt timed out.
    Timeout,
    /// The pipe died and the transparent reconnect did not help.
    TransportClosed,
    /// The tool itself reported an error.
    Tool,
    /// Unknown / disabled server or bad configuration.
    Config,
    /// Malformed reply from the server.
    Protocol,
}

impl From<&McpError> for ToolErrorKind {
    fn from(err: &McpError) -> Self {
        match err {
            McpError::SpawnFailed { .. }
            | McpError::ResourceExhausted { .. }
            | McpError::InitFailed { .. }
            | McpError::RestartExhausted { .. }
            | McpError::TransportError { .. } => ToolErrorKind::Connection,
            McpError::ConnectTimeout { .. } | McpError::Timeout { .. } => ToolErrorKind::Timeout,
            McpError::TransportClosed { .. } => ToolErrorKind::TransportClosed,
            McpError::ServerError { .. } => ToolErrorKind::Tool,
            McpError::UnknownServer { .. }
            | McpError::ServerDisabled { .. }
            | McpError::ConfigError { .. }
            | McpError::ShuttingDown => ToolErrorKind::Config,
        }
    }
}

/// Result of a tool call execution. Failures are data, never thrown.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub server: String,
    pub tool_name: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ToolErrorKind>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    /// A successful call.
    pub fn ok(server: &str, tool: &str, result: serde_json::Value, elapsed_ms: u64) -> Self {
        Self {
            server: server.to_string(),
            tool_name: tool.to_string(),
            success: true,
            result: Some(result),
            error: None,
            error_kind: None,
            execution_time_ms: elapsed_ms,
        }
    }

    /// A failed call with an explicit category.
    pub fn failed(
        server: &str,
        tool: &str,
        kind: ToolErrorKind,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            server: server.to_string(),
            tool_name: tool.to_string(),
            success: false,
            result: None,
            error: Some(error.into()),
            error_kind: Some(kind),
            execution_time_ms: elapsed_ms,
        }
    }

    /// A failed call derived from a client-side error.
    pub fn from_error(server: &str, tool: &str, err: &McpError, elapsed_ms: u64) -> Self {
        Self::failed(server, tool, ToolErrorKind::from(err), err.to_string(), elapsed_ms)
    }

    /// The structured `{"error": message}` form of a failed call.
    pub fn error_payload(&self) -> Option<serde_json::Value> {
        self.error
            .as_ref()
            .map(|message| serde_json::json!({ "error": message }))
    }

    /// Flatten the result to text: joined `content[].text` items, or the raw JSON.
    pub fn text(&self) -> String {
        let Some(result) = &self.result else {
            return self.error.clone().unwrap_or_default();
        };
        match result.get("content").and_then(|c| c.as_array()) {
            Some(items) => items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            None => result.to_string(),
        }
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_initialize_params_announce_client() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
    }

    #[test]
    fn test_list_tools_defaults_to_empty() {
        let parsed: ListToolsResult = serde_json::from_str("{}").unwrap();
        assert!(parsed.tools.is_empty());

        let json = r#"{"tools": [{"name": "open_app", "inputSchema": {"type": "object"}}]}"#;
        let parsed: ListToolsResult = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.tools[0].name, "open_app");
        assert_eq!(parsed.tools[0].input_schema["type"], "object");
    }

    #[test]
    fn test_server_config_connect_timeout_override() {
        let default = Duration::from_secs(30);
        let mut config = ServerConfig {
            command: "echo".into(),
            ..Default::default()
        };
        assert_eq!(config.connect_timeout(default), default);

        config.connect_timeout = Some(2.5);
        assert_eq!(config.connect_timeout(default), Duration::from_millis(2500));

        config.connect_timeout = Some(-1.0);
        assert_eq!(config.connect_timeout(default), default);
    }

    #[test]
    fn test_servers_config_accepts_mcp_servers_key() {
        let json = r#"{"mcpServers": {"alpha": {"command": "echo", "disabled": true}}}"#;
        let config: McpServersConfig = serde_json::from_str(json).unwrap();
        assert!(config.servers["alpha"].disabled);
        assert!(config.intents.is_empty());
    }

    #[test]
    fn test_tool_call_result_text_and_payload() {
        let ok = ToolCallResult::ok(
            "notes",
            "read",
            serde_json::json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]}),
            3,
        );
        assert_eq!(ok.text(), "a\nb");
        assert!(ok.error_payload().is_none());

        let err = McpError::Timeout {
            tool: "read".into(),
            timeout_ms: 10,
        };
        let failed = ToolCallResult::from_error("notes", "read", &err, 10);
        assert_eq!(failed.error_kind, Some(ToolErrorKind::Timeout));
        assert_eq!(
            failed.error_payload().unwrap()["error"],
            "tool call 'read' timed out after 10ms"
        );
    }
}

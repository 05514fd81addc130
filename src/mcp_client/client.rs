//! MCP Client: the session manager's public facade.
//!
//! Owns the server configurations, the session registry and the restart
//! gate. Every method takes `&self`, so one client is shared as
//! `Arc<McpClient>` between the executor, the health monitor and any UI.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;

use super::connector::Connector;
use super::errors::McpError;
use super::health::HealthMonitor;
use super::intents::IntentMap;
use super::lifecycle::StdioConnector;
use super::sessions::{Lookup, Session, SessionRegistry};
use super::supervisor::ConnectionTask;
use super::types::{
    IntentTarget, McpServersConfig, McpToolDefinition, ServerConfig, ToolCallResult, ToolErrorKind,
};
use crate::config::McpSettings;
use crate::events::{EventSink, TracingSink};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Marker appended to a truncated text result.
pub const TRUNCATION_MARKER: &str = "\n... [TRUNCATED DUE TO SIZE] ...";

/// Overall bound on gathering tool names for the catalog.
const CATALOG_TIMEOUT: Duration = Duration::from_secs(2);

/// Tool names listed per server in the catalog.
const CATALOG_TOOLS_PER_SERVER: usize = 10;

/// Per-server bound on listing tools for the full summary.
const SUMMARY_SERVER_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Status ──────────────────────────────────────────────────────────────────

/// Snapshot of the manager's state.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    /// Servers with a published session, sorted.
    pub connected: Vec<String>,
    /// Every configured server (including disabled ones), sorted.
    pub configured: Vec<String>,
    pub session_count: usize,
    pub shutting_down: bool,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Session manager for every configured tool server.
pub struct McpClient {
    pub(super) configs: HashMap<String, ServerConfig>,
    intents: IntentMap,
    pub(super) settings: McpSettings,
    connector: Arc<dyn Connector>,
    pub(super) registry: Arc<SessionRegistry>,
    pub(super) events: Arc<dyn EventSink>,
    /// At most `max_concurrent_restarts` restarts run at once.
    pub(super) restart_gate: Semaphore,
    /// Serializes the teardown half of restarts.
    pub(super) restart_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    pub(super) health: Mutex<Option<HealthMonitor>>,
}

impl McpClient {
    /// Create a client that spawns servers as stdio child processes.
    pub fn new(config: McpServersConfig, settings: McpSettings) -> Self {
        let connector = Arc::new(StdioConnector::new(settings.working_dir.clone()));
        Self::with_connector(config, settings, connector)
    }

    /// Create a client over an arbitrary connector.
    pub fn with_connector(
        config: McpServersConfig,
        settings: McpSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let intents = IntentMap::from_config(&config).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "mcp: ignoring invalid intent table");
            IntentMap::default()
        });
        let permits = settings.max_concurrent_restarts.max(1);

        Self {
            configs: config.servers,
            intents,
            settings,
            connector,
            registry: Arc::new(SessionRegistry::new()),
            events: Arc::new(TracingSink),
            restart_gate: Semaphore::new(permits),
            restart_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            health: Mutex::new(None),
        }
    }

    /// Route lifecycle events to a different sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &McpSettings {
        &self.settings
    }

    /// Look up a server's configuration, rejecting unknown and disabled ones.
    pub(super) fn server_config(&self, name: &str) -> Result<&ServerConfig, McpError> {
        let config = self.configs.get(name).ok_or_else(|| McpError::UnknownServer {
            name: name.to_string(),
        })?;
        if config.disabled {
            return Err(McpError::ServerDisabled {
                name: name.to_string(),
            });
        }
        Ok(config)
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    /// Return the server's live session, connecting if necessary.
    ///
    /// Concurrent callers for one server share a single connection task.
    /// Waiting is bounded by the server's connect timeout; a timeout here
    /// leaves the in-flight task running for whoever asks next.
    pub async fn get_session(&self, name: &str) -> Result<Arc<Session>, McpError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(McpError::ShuttingDown);
        }
        let config = self.server_config(name)?;
        let connect_timeout = config.connect_timeout(self.settings.connect_timeout());

        loop {
            let lookup = self.registry.lookup_or_start(name, |start| {
                let task = ConnectionTask {
                    name: name.to_string(),
                    config: config.clone(),
                    generation: start.generation,
                    connect_timeout,
                    connector: Arc::clone(&self.connector),
                    registry: Arc::clone(&self.registry),
                    events: Arc::clone(&self.events),
                };
                tokio::spawn(task.run(start.publish, start.close))
            });

            match lookup {
                Lookup::Ready(session) => return Ok(session),
                Lookup::ShutDown => return Err(McpError::ShuttingDown),
                Lookup::Closing(exited) => {
                    tracing::debug!(server = name, "mcp: waiting for previous connection to close");
                    exited.await;
                }
                Lookup::Pending(pending) => {
                    return match tokio::time::timeout(connect_timeout, pending).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(McpError::ConnectTimeout {
                            name: name.to_string(),
                            timeout_ms: connect_timeout.as_millis() as u64,
                        }),
                    };
                }
            }
        }
    }

    /// Close one specific session and wait until its task has exited.
    ///
    /// A session that has already been replaced is left alone.
    async fn drop_session(&self, name: &str, session_id: u64) {
        if let Some(exited) = self.registry.request_close(name, Some(session_id)) {
            exited.await;
        }
    }

    /// Connect every enabled server concurrently.
    ///
    /// Returns the servers that failed to connect; partial startup is fine.
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let mut names: Vec<&String> = self
            .configs
            .iter()
            .filter(|(_, cfg)| !cfg.disabled)
            .map(|(name, _)| name)
            .collect();
        names.sort();

        let attempts = names.iter().map(|name| async move {
            let outcome = self.get_session(name).await;
            (name.to_string(), outcome)
        });
        let results = futures::future::join_all(attempts).await;

        let mut errors = Vec::new();
        for (name, outcome) in results {
            if let Err(e) = outcome {
                tracing::warn!(server = %name, error = %e, "mcp: server failed to start");
                errors.push((name, e));
            }
        }
        tracing::info!(
            connected = self.registry.session_count(),
            failed = errors.len(),
            "mcp: startup complete"
        );
        errors
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call a tool with the default call timeout. Never returns an error.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> ToolCallResult {
        self.call_tool_with_timeout(server, tool, arguments, self.settings.call_timeout())
            .await
    }

    /// Call a tool, bounding the call itself by `timeout`.
    ///
    /// A dead pipe gets exactly one transparent reconnect-and-retry. Tool
    /// errors, JSON-RPC errors and timeouts come back as failed results; a
    /// timeout does not tear the session down.
    pub async fn call_tool_with_timeout(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> ToolCallResult {
        let start = Instant::now();
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;
        let mut reconnected = false;

        loop {
            let session = match self.get_session(server).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(server, tool, error = %e, "mcp: no session for tool call");
                    return ToolCallResult::from_error(server, tool, &e, elapsed(start));
                }
            };

            let call = tokio::time::timeout(timeout, session.call_tool(tool, arguments.clone()));
            match call.await {
                Err(_) => {
                    tracing::warn!(server, tool, timeout_ms = timeout.as_millis() as u64, "mcp: tool call timed out");
                    let err = McpError::Timeout {
                        tool: tool.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    return ToolCallResult::from_error(server, tool, &err, elapsed(start));
                }
                Ok(Ok(value)) => return self.finish_call(server, tool, value, elapsed(start)),
                Ok(Err(e)) if e.is_transport_closed() && !reconnected => {
                    tracing::warn!(
                        server,
                        tool,
                        session_id = session.id(),
                        error = %e,
                        "mcp: transport closed, reconnecting once"
                    );
                    reconnected = true;
                    self.drop_session(server, session.id()).await;
                }
                Ok(Err(McpError::ServerError { code, message, .. })) => {
                    return ToolCallResult::failed(
                        server,
                        tool,
                        ToolErrorKind::Tool,
                        format!("[{code}] {message}"),
                        elapsed(start),
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!(server, tool, error = %e, "mcp: tool call failed");
                    return ToolCallResult::from_error(server, tool, &e, elapsed(start));
                }
            }
        }
    }

    /// Turn a raw `tools/call` result into a `ToolCallResult`.
    fn finish_call(
        &self,
        server: &str,
        tool: &str,
        mut value: serde_json::Value,
        elapsed_ms: u64,
    ) -> ToolCallResult {
        truncate_text_content(&mut value, self.settings.max_result_bytes);

        let is_error = value
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !is_error {
            tracing::debug!(server, tool, elapsed_ms, "mcp: tool call succeeded");
            return ToolCallResult::ok(server, tool, value, elapsed_ms);
        }

        let message = ToolCallResult::ok(server, tool, value, elapsed_ms).text();
        let message = if message.trim().is_empty() {
            "tool reported an error".to_string()
        } else {
            message
        };
        ToolCallResult::failed(server, tool, ToolErrorKind::Tool, message, elapsed_ms)
    }

    /// List a server's tools. A server that yields nothing yields `[]`.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let session = self.get_session(server).await?;
        let timeout = self.settings.call_timeout();
        tokio::time::timeout(timeout, session.list_tools())
            .await
            .map_err(|_| McpError::Timeout {
                tool: "tools/list".into(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Resolve a logical intent to its configured `(server, tool)`.
    pub fn resolve_intent(&self, intent: &str) -> Option<&IntentTarget> {
        self.intents.resolve(intent)
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Stop the health monitor, close every session and wait for every
    /// connection task to exit. Later `get_session` calls fail.
    ///
    /// Returns whether the registry ended up empty.
    pub async fn cleanup(&self) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop_health_monitor().await;

        let exits = self.registry.shut_down();
        tracing::info!(tasks = exits.len(), "mcp: shutting down sessions");
        for (name, exited) in exits {
            exited.await;
            tracing::debug!(server = %name, "mcp: connection task exited");
        }

        let empty = self.registry.is_empty();
        if !empty {
            tracing::error!(remaining = self.registry.len(), "mcp: registry not empty after cleanup");
        }
        debug_assert!(empty, "connection tasks survived cleanup");
        empty
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            connected: self.registry.connected_servers(),
            configured: self.configured_servers(),
            session_count: self.registry.session_count(),
            shutting_down: self.shutting_down.load(Ordering::SeqCst),
        }
    }

    /// Names of all configured servers, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a server currently has a published session.
    pub fn is_connected(&self, name: &str) -> bool {
        self.registry.session(name).is_some()
    }

    /// Number of connection tasks that have not fully exited.
    pub fn active_tasks(&self) -> usize {
        self.registry.len()
    }

    /// Human- and model-readable catalog of configured servers.
    ///
    /// Only already-connected servers are asked for tool names, and the
    /// whole gathering step is bounded; a slow server just loses its list.
    pub async fn catalog(&self) -> String {
        let names = self.configured_servers();

        let listings = names.iter().filter_map(|name| {
            let session = self.registry.session(name)?;
            Some(async move {
                let tools = session.list_tools().await.unwrap_or_default();
                let tool_names: Vec<String> = tools.into_iter().map(|t| t.name).collect();
                (name.clone(), tool_names)
            })
        });
        let tools: HashMap<String, Vec<String>> =
            match tokio::time::timeout(CATALOG_TIMEOUT, futures::future::join_all(listings)).await {
                Ok(results) => results.into_iter().collect(),
                Err(_) => {
                    tracing::debug!("mcp: catalog tool listing timed out");
                    HashMap::new()
                }
            };

        let mut catalog = String::from("TOOL SERVERS:\n");
        for name in &names {
            let Some(config) = self.configs.get(name) else {
                continue;
            };
            let status = if config.disabled {
                "DISABLED"
            } else if self.is_connected(name) {
                "CONNECTED"
            } else {
                "AVAILABLE"
            };
            let description = config
                .description
                .as_deref()
                .unwrap_or("Native or custom capability.");

            let mut line = format!("[{status}] {name}: {description}");
            if let Some(tool_names) = tools.get(name).filter(|t| !t.is_empty()) {
                let shown: Vec<&str> = tool_names
                    .iter()
                    .take(CATALOG_TOOLS_PER_SERVER)
                    .map(String::as_str)
                    .collect();
                line.push_str(&format!(" (Tools: {}", shown.join(", ")));
                if tool_names.len() > CATALOG_TOOLS_PER_SERVER {
                    line.push_str(", ...");
                }
                line.push(')');
            }
            catalog.push_str(&line);
            catalog.push('\n');
        }
        catalog
    }

    /// Every enabled server's tools with descriptions and input schemas.
    ///
    /// Servers are connected on demand. Each gets its own time bound, and
    /// one that fails or lists nothing is marked unresponsive.
    pub async fn tools_summary(&self) -> String {
        let names: Vec<String> = self
            .configured_servers()
            .into_iter()
            .filter(|name| self.configs.get(name).is_some_and(|cfg| !cfg.disabled))
            .collect();

        let listings = names.iter().map(|name| async move {
            let tools = match tokio::time::timeout(SUMMARY_SERVER_TIMEOUT, self.list_tools(name)).await {
                Ok(Ok(tools)) => tools,
                Ok(Err(e)) => {
                    tracing::debug!(server = %name, error = %e, "mcp: summary listing failed");
                    Vec::new()
                }
                Err(_) => {
                    tracing::debug!(server = %name, "mcp: summary listing timed out");
                    Vec::new()
                }
            };
            (name, tools)
        });
        let results = futures::future::join_all(listings).await;

        let mut summary = String::from("AVAILABLE TOOLS:\n");
        for (name, tools) in results {
            if tools.is_empty() {
                summary.push_str(&format!("- {name} (No tools responsive)\n"));
                continue;
            }
            summary.push_str(&format!("\n--- SERVER: {name} ---\n"));
            for tool in tools {
                summary.push_str(&describe_tool(&tool));
            }
        }
        summary
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        // Tasks outlive a client dropped without cleanup(); ask them to stop.
        let _ = self.registry.shut_down();
        if let Ok(mut health) = self.health.lock() {
            if let Some(monitor) = health.take() {
                monitor.abort();
            }
        }
    }
}

/// One summary entry: description, argument list and compact schema.
fn describe_tool(tool: &McpToolDefinition) -> String {
    let description = if tool.description.is_empty() {
        "No description"
    } else {
        tool.description.as_str()
    };
    let mut entry = format!("- {}: {description}\n", tool.name);

    let schema = &tool.input_schema;
    let has_schema = schema.as_object().is_some_and(|o| !o.is_empty());
    if !has_schema {
        return entry;
    }
    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        if !props.is_empty() {
            let args: Vec<String> = props
                .iter()
                .map(|(arg, spec)| {
                    let kind = spec.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                    format!("{arg} ({kind})")
                })
                .collect();
            entry.push_str(&format!("  Args: {}\n", args.join(", ")));
        }
    }
    entry.push_str(&format!("  Schema: {schema}\n"));
    entry
}

// ─── Result Truncation ───────────────────────────────────────────────────────

/// Truncate every `content[].text` item longer than `max_bytes`.
pub fn truncate_text_content(value: &mut serde_json::Value, max_bytes: usize) {
    let Some(items) = value.get_mut("content").and_then(|c| c.as_array_mut()) else {
        return;
    };
    for item in items {
        if let Some(serde_json::Value::String(text)) = item.get_mut("text") {
            if text.len() > max_bytes {
                let original = text.len();
                truncate_utf8(text, max_bytes);
                text.push_str(TRUNCATION_MARKER);
                tracing::warn!(original_bytes = original, max_bytes, "mcp: tool result truncated");
            }
        }
    }
}

/// Cut a string to at most `max_bytes` on a char boundary.
fn truncate_utf8(text: &mut String, max_bytes: usize) {
    let mut cut = max_bytes.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

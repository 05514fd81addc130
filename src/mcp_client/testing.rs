//! In-memory tool servers for session manager tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use super::connector::{ChannelOwner, Connection, Connector, RpcChannel};
use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig};
use crate::config::McpSettings;

/// Connector whose servers live in memory and whose failures are scripted.
#[derive(Default)]
pub(crate) struct FakeConnector {
    /// Outcomes for successive connects; an empty script means success.
    script: Mutex<VecDeque<McpError>>,
    /// When set, every connect fails with a spawn error.
    always_fail: AtomicBool,
    /// Answer the handshake with this protocol version.
    protocol: Mutex<Option<String>>,
    pub connect_delay: Mutex<Duration>,
    pub connects: AtomicUsize,
    pub shutdowns: Arc<AtomicUsize>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Shared across sessions: the next N tool calls report a dead pipe.
    close_next_calls: Arc<AtomicUsize>,
    /// Shared across sessions: `tools/list` fails while set.
    unhealthy: Arc<AtomicBool>,
    /// How long each owner takes to shut down.
    shutdown_delay: Arc<Mutex<Duration>>,
    /// Completed shutdowns observed at the start of each connect.
    shutdowns_at_connect: Mutex<Vec<usize>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = McpError>) {
        self.script.lock().unwrap().extend(errors);
    }

    pub fn fail_always(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    pub fn set_protocol(&self, version: &str) {
        *self.protocol.lock().unwrap() = Some(version.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn close_next_calls(&self, n: usize) {
        self.close_next_calls.store(n, Ordering::SeqCst);
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    pub fn set_shutdown_delay(&self, delay: Duration) {
        *self.shutdown_delay.lock().unwrap() = delay;
    }

    pub fn shutdowns_at_connect(&self) -> Vec<usize> {
        self.shutdowns_at_connect.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, name: &str, _config: &ServerConfig) -> Result<Connection, McpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.shutdowns_at_connect
            .lock()
            .unwrap()
            .push(self.shutdowns.load(Ordering::SeqCst));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: "No such file or directory".into(),
            });
        }

        let died = Arc::new(Notify::new());
        let channel = FakeChannel {
            server: name.to_string(),
            protocol: self.protocol.lock().unwrap().clone(),
            dead: AtomicBool::new(false),
            died: Arc::clone(&died),
            close_next_calls: Arc::clone(&self.close_next_calls),
            unhealthy: Arc::clone(&self.unhealthy),
        };
        Ok(Connection {
            channel: Arc::new(channel),
            owner: Box::new(FakeOwner {
                died,
                shutdowns: Arc::clone(&self.shutdowns),
                delay: *self.shutdown_delay.lock().unwrap(),
            }),
        })
    }
}

struct FakeChannel {
    server: String,
    protocol: Option<String>,
    dead: AtomicBool,
    died: Arc<Notify>,
    close_next_calls: Arc<AtomicUsize>,
    unhealthy: Arc<AtomicBool>,
}

impl FakeChannel {
    fn closed(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server.clone(),
            reason: "stdout closed".into(),
        }
    }
}

#[async_trait]
impl RpcChannel for FakeChannel {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(self.closed());
        }
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": self.protocol.as_deref().unwrap_or("2024-11-05"),
                "capabilities": {"tools": {}},
                "serverInfo": {"name": self.server, "version": "0.0.1"},
            })),
            "tools/list" => {
                if self.unhealthy.load(Ordering::SeqCst) {
                    return Err(McpError::TransportError {
                        server: self.server.clone(),
                        reason: "tools/list failed".into(),
                    });
                }
                let mut tools: Vec<Value> = (1..=12)
                    .map(|i| json!({"name": format!("tool_{i:02}"), "description": "", "inputSchema": {}}))
                    .collect();
                tools[0] = json!({
                    "name": "tool_01",
                    "description": "Read a file",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"path": {"type": "string"}, "raw": {}},
                    },
                });
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                let dying = self
                    .close_next_calls
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if dying {
                    self.dead.store(true, Ordering::SeqCst);
                    self.died.notify_one();
                    return Err(self.closed());
                }
                match tool.as_str() {
                    "fail" => Ok(json!({"content": [{"type": "text", "text": "boom"}], "isError": true})),
                    "reject" => Err(McpError::ServerError {
                        code: -32602,
                        message: "invalid params".into(),
                        data: None,
                    }),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(json!({"content": []}))
                    }
                    "big" => Ok(json!({"content": [{"type": "text", "text": "é".repeat(64)}]})),
                    "echo" => Ok(json!({"content": [{"type": "text", "text": params["arguments"].to_string()}]})),
                    _ => Ok(json!({"content": [{"type": "text", "text": format!("{tool} ok")}]})),
                }
            }
            other => Err(McpError::ServerError {
                code: -32601,
                message: format!("method not found: {other}"),
                data: None,
            }),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(self.closed());
        }
        Ok(())
    }
}

struct FakeOwner {
    died: Arc<Notify>,
    shutdowns: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl ChannelOwner for FakeOwner {
    async fn closed(&mut self) -> String {
        self.died.notified().await;
        "process exited".into()
    }

    async fn shutdown(self: Box<Self>) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Servers file with the given enabled names plus a disabled `legacy`.
pub(crate) fn servers(names: &[&str]) -> McpServersConfig {
    let mut servers: HashMap<String, ServerConfig> = names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                ServerConfig {
                    command: "fake-server".into(),
                    description: Some(format!("{name} tools")),
                    ..Default::default()
                },
            )
        })
        .collect();
    servers.insert(
        "legacy".into(),
        ServerConfig {
            command: "legacy-server".into(),
            disabled: true,
            ..Default::default()
        },
    );
    McpServersConfig {
        servers,
        intents: HashMap::new(),
    }
}

/// Settings with millisecond-scale timings.
pub(crate) fn fast_settings() -> McpSettings {
    McpSettings {
        connect_timeout_secs: 2.0,
        call_timeout_secs: 2.0,
        restart_backoff_base_ms: 10,
        restart_backoff_cap_ms: 40,
        health_probe_timeout_secs: 1.0,
        ..Default::default()
    }
}

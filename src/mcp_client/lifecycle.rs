//! Server process lifecycle: spawning and tearing down stdio child processes.
//!
//! Each tool server runs as a separate OS process communicating via JSON-RPC
//! over stdio. [`StdioConnector`] spawns the process; the returned
//! [`StdioProcess`] owner is held by the connection task for the process's
//! whole life and is the only thing that ever kills it.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::connector::{ChannelOwner, Connection, Connector};
use super::errors::{spawn_error, McpError};
use super::transport::StdioTransport;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful exit after stdin is closed, before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes of stderr kept for failure diagnostics.
const STDERR_TAIL_BYTES: usize = 2000;

// ─── Connector ───────────────────────────────────────────────────────────────

/// Spawns tool servers as child processes speaking JSON-RPC over stdio.
#[derive(Debug, Clone, Default)]
pub struct StdioConnector {
    /// Fallback working directory when a server has no `cwd`.
    working_dir: Option<String>,
}

impl StdioConnector {
    pub fn new(working_dir: Option<String>) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, name: &str, config: &ServerConfig) -> Result<Connection, McpError> {
        if config.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' has an empty command"),
            });
        }
        if !config.missing_env.is_empty() {
            return Err(McpError::ConfigError {
                reason: format!(
                    "server '{name}' needs unset environment variables: {}",
                    config.missing_env.join(", ")
                ),
            });
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(&config.env);

        let effective_dir = config.cwd.as_deref().or(self.working_dir.as_deref());
        if let Some(dir) = effective_dir {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // A connection task dropped mid-handshake must not leak its child.
        cmd.kill_on_drop(true);

        tracing::debug!(server = name, command = %config.command, args = ?config.args, "mcp: spawning server");

        let mut child = cmd.spawn().map_err(|e| spawn_error(name, &e))?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail));
        }

        let transport = Arc::new(StdioTransport::new(name, stdin, stdout));

        Ok(Connection {
            channel: transport.clone(),
            owner: Box::new(StdioProcess {
                name: name.to_string(),
                child,
                transport,
                stderr_tail,
            }),
        })
    }
}

// ─── Process Owner ───────────────────────────────────────────────────────────

/// A running tool-server process, owned by its connection task.
pub struct StdioProcess {
    name: String,
    child: Child,
    transport: Arc<StdioTransport>,
    stderr_tail: Arc<Mutex<String>>,
}

#[async_trait]
impl ChannelOwner for StdioProcess {
    async fn closed(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => format!("process exited ({status})"),
            Err(e) => format!("failed to wait for process: {e}"),
        }
    }

    async fn failure_context(&mut self) -> String {
        // Give the drain task a moment to pick up the last lines.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let tail = self
            .stderr_tail
            .lock()
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        format_stderr_suffix(&tail)
    }

    async fn shutdown(mut self: Box<Self>) {
        self.transport.close_stdin().await;

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "mcp: server exited");
            }
            _ => {
                tracing::warn!(server = %self.name, "mcp: server ignored stdin EOF, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Forward the child's stderr to the log and keep a bounded tail for diagnostics.
///
/// Draining also keeps a chatty server from blocking on a full stderr pipe.
fn drain_stderr(name: String, stderr: ChildStderr, tail: Arc<Mutex<String>>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %name, "stderr: {line}");
            if let Ok(mut buf) = tail.lock() {
                buf.push_str(&line);
                buf.push('\n');
                if buf.len() > STDERR_TAIL_BYTES {
                    let mut cut = buf.len() - STDERR_TAIL_BYTES;
                    while !buf.is_char_boundary(cut) {
                        cut += 1;
                    }
                    buf.drain(..cut);
                }
            }
        }
    });
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {stderr}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with tool-server child processes:
//! - A writer task owns stdin; requests are queued to it as whole lines
//! - A reader task owns stdout and routes each reply to its waiter by id
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Any number of requests may be in flight on one transport. Dropping a
//! request future (e.g. on timeout) never leaves a partial line on stdin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::connector::RpcChannel;
use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type Reply = Result<JsonRpcResponse, McpError>;

/// Requests awaiting a reply, plus the terminal error once stdout is gone.
#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
    closed: Option<McpError>,
}

type SharedPending = Arc<Mutex<Pending>>;

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fail every waiter with `err` and refuse new requests.
fn fail_all(pending: &Mutex<Pending>, err: McpError) {
    let mut state = lock(pending);
    if state.closed.is_none() {
        state.closed = Some(err);
    }
    let Some(err) = state.closed.clone() else {
        return;
    };
    for (_, waiter) in state.waiters.drain() {
        let _ = waiter.send(Err(err.clone()));
    }
}

/// Queue to the writer task, and the task itself.
struct Outbound {
    lines: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Removes an abandoned request's waiter so its late reply is skipped.
struct WaiterGuard<'a> {
    pending: &'a Mutex<Pending>,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).waiters.remove(&self.id);
    }
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    pending: SharedPending,
    outbound: Mutex<Option<Outbound>>,
}

impl StdioTransport {
    /// Create a new transport from a writer (child stdin) and reader (child stdout).
    ///
    /// Spawns the reader and writer tasks, so it must be called inside a runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: SharedPending = Arc::default();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(write_loop(
            server_name.to_string(),
            writer,
            lines_rx,
            Arc::clone(&pending),
        ));
        tokio::spawn(read_loop(server_name.to_string(), reader, Arc::clone(&pending)));

        Self {
            server_name: server_name.to_string(),
            pending,
            outbound: Mutex::new(Some(Outbound {
                lines: lines_tx,
                task,
            })),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Other requests may run concurrently; replies are matched by id.
    pub async fn exchange(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        json.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = lock(&self.pending);
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }
            state.waiters.insert(id, reply_tx);
        }
        let _guard = WaiterGuard {
            pending: &self.pending,
            id,
        };

        self.send_line(json)?;

        reply_rx.await.unwrap_or_else(|_| {
            Err(McpError::TransportClosed {
                server: self.server_name.clone(),
                reason: "reader stopped before replying".into(),
            })
        })
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        json.push('\n');

        self.send_line(json)
    }

    /// Close the write side once queued lines are flushed. The server sees
    /// EOF on stdin and should exit.
    pub async fn close_stdin(&self) {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(Outbound { lines, task }) = outbound {
            drop(lines);
            let _ = task.await;
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    /// Queue one complete line for the writer task.
    fn send_line(&self, line: String) -> Result<(), McpError> {
        let outbound = self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(outbound) = outbound.as_ref() else {
            return Err(McpError::TransportClosed {
                server: self.server_name.clone(),
                reason: "stdin already closed".into(),
            });
        };
        outbound.lines.send(line).map_err(|_| McpError::TransportClosed {
            server: self.server_name.clone(),
            reason: "stdin writer stopped".into(),
        })
    }
}

/// Drain queued lines into stdin. A failed write fails every pending request.
async fn write_loop<W>(
    server: String,
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<String>,
    pending: SharedPending,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(line) = lines.recv().await {
        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::debug!(server = %server, error = %e, "mcp: stdin write failed");
            fail_all(&pending, io_error(&server, "failed to write to stdin", &e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Route replies from stdout to their waiters until EOF.
async fn read_loop<R>(server: String, reader: R, pending: SharedPending)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut line_buf = String::new();
    let err = loop {
        line_buf.clear();
        match reader.read_line(&mut line_buf).await {
            Ok(0) => {
                break McpError::TransportClosed {
                    server: server.clone(),
                    reason: "server stdout closed (process may have exited)".into(),
                };
            }
            Ok(_) => {}
            Err(e) => break io_error(&server, "failed to read from stdout", &e),
        }

        let trimmed = line_buf.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(resp) => {
                let waiter = lock(&pending).waiters.remove(&resp.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(resp));
                    }
                    None => tracing::debug!(
                        server = %server,
                        stale_id = resp.id,
                        "mcp: skipping response for abandoned request"
                    ),
                }
            }
            Err(_) => {
                // Notifications and log output share stdout with replies.
                tracing::trace!(server = %server, line = trimmed, "mcp: non-response line");
            }
        }
    };

    tracing::debug!(server = %server, reason = %err, "mcp: stdout reader stopped");
    fail_all(&pending, err);
}

/// Map an I/O error, separating dead-pipe errors from everything else.
fn io_error(server: &str, context: &str, err: &std::io::Error) -> McpError {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => {
            McpError::TransportClosed {
                server: server.to_string(),
                reason: format!("{context}: {err}"),
            }
        }
        _ => McpError::TransportError {
            server: server.to_string(),
            reason: format!("{context}: {err}"),
        },
    }
}

#[async_trait]
impl RpcChannel for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let response = self.exchange(method, params).await?;
        extract_result(response)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.send_notification(method, params).await
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    /// Spawn a fake server on the far side of two in-memory pipes.
    ///
    /// It echoes each request's id back with `{"echo": method}` as the
    /// result, preceded by a log line and a stale reply.
    fn fake_server() -> StdioTransport {
        let (client_out, server_in) = duplex(4096);
        let (mut server_out, client_in) = duplex(4096);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let Some(id) = req.get("id").and_then(|v| v.as_u64()) else {
                    continue;
                };
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"echo": req["method"]},
                });
                let stale = serde_json::json!({"jsonrpc": "2.0", "id": 0, "result": null});
                let out = format!("server booting...\n{stale}\n{reply}\n");
                if server_out.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        StdioTransport::new("fake", client_out, client_in)
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_request_skips_noise_and_matches_id() {
        let transport = fake_server();
        let result = transport.request("tools/list", None).await.unwrap();
        assert_eq!(result["echo"], "tools/list");

        // A second exchange on the same pipes still correlates correctly.
        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result["echo"], "ping");
    }

    #[tokio::test]
    async fn test_eof_is_transport_closed() {
        let (client_out, _server_in) = duplex(1024);
        let (server_out, client_in) = duplex(1024);
        drop(server_out);

        let transport = StdioTransport::new("gone", client_out, client_in);
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(err.is_transport_closed(), "got {err:?}");
    }

    /// A server that answers every request from its own task.
    ///
    /// `slow` replies after 500ms, everything else at once. Reading starts
    /// after `read_delay`, and the client-to-server pipe holds only
    /// `pipe_bytes`, so large requests stall mid-write until then.
    fn concurrent_server(pipe_bytes: usize, read_delay: Duration) -> StdioTransport {
        let (client_out, server_in) = duplex(pipe_bytes);
        let (server_out, client_in) = duplex(64 * 1024);
        let server_out = Arc::new(tokio::sync::Mutex::new(server_out));

        tokio::spawn(async move {
            tokio::time::sleep(read_delay).await;
            let mut lines = BufReader::new(server_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let Some(id) = req.get("id").and_then(|v| v.as_u64()) else {
                    continue;
                };
                let out = Arc::clone(&server_out);
                tokio::spawn(async move {
                    let method = req["method"].as_str().unwrap_or_default().to_string();
                    if method == "slow" {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"echo": method}});
                    let _ = out.lock().await.write_all(format!("{reply}\n").as_bytes()).await;
                });
            }
        });

        StdioTransport::new("concurrent", client_out, client_in)
    }

    #[tokio::test]
    async fn test_in_flight_requests_do_not_block_each_other() {
        let transport = Arc::new(concurrent_server(64 * 1024, Duration::ZERO));

        let slow = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("slow", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.in_flight(), 1);

        let quick = tokio::time::timeout(
            Duration::from_millis(200),
            transport.request("tools/list", None),
        )
        .await
        .expect("a quick request must not wait behind a slow one")
        .unwrap();
        assert_eq!(quick["echo"], "tools/list");

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow["echo"], "slow");
        assert_eq!(transport.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_leaves_pipe_usable() {
        let transport = concurrent_server(64, Duration::from_millis(200));

        let blob = "x".repeat(16 * 1024);
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            transport.request("big", Some(serde_json::json!({ "blob": blob }))),
        )
        .await;
        assert!(cancelled.is_err(), "the server is not reading yet");
        assert_eq!(transport.in_flight(), 0, "abandoned waiter is removed");

        let next = tokio::time::timeout(Duration::from_secs(2), transport.request("ping", None))
            .await
            .expect("request after a cancelled one must complete")
            .unwrap();
        assert_eq!(next["echo"], "ping");
    }

    #[tokio::test]
    async fn test_eof_fails_every_pending_request() {
        let (client_out, _server_in) = duplex(1024);
        let (server_out, client_in) = duplex(1024);
        let transport = Arc::new(StdioTransport::new("dying", client_out, client_in));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move { transport.request("tools/list", None).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(server_out);

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(err.is_transport_closed(), "got {err:?}");
        }
    }

    #[tokio::test]
    async fn test_write_after_close_stdin_is_transport_closed() {
        let transport = fake_server();
        transport.close_stdin().await;
        let err = transport.notify("notifications/initialized", None).await.unwrap_err();
        assert!(err.is_transport_closed());
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }
}

//! Session handles and the registry that maps server names to them.
//!
//! The registry is the only shared mutable structure in the session manager.
//! Each entry ("slot") tracks one connection task: its pending session
//! future, its published session once the handshake completes, its close
//! signal, and a future that resolves when the task has exited. All
//! mutations happen under one short, never-held-across-await lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use super::connector::RpcChannel;
use super::errors::McpError;
use super::types::{ListToolsResult, McpToolDefinition, ServerInfo};

// ─── Session ─────────────────────────────────────────────────────────────────

/// Source of session ids; also the generation stamp of registry slots.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// An established, initialized RPC channel to one tool server.
///
/// Immutable once published. Dropping a `Session` does not close anything;
/// only the connection task that created it can do that.
pub struct Session {
    server: String,
    id: u64,
    channel: Arc<dyn RpcChannel>,
    server_info: Option<ServerInfo>,
    protocol_version: Option<String>,
    connected_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.server)
            .field("id", &self.id)
            .field("protocol_version", &self.protocol_version)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        server: &str,
        id: u64,
        channel: Arc<dyn RpcChannel>,
        server_info: Option<ServerInfo>,
        protocol_version: Option<String>,
    ) -> Self {
        Self {
            server: server.to_string(),
            id,
            channel,
            server_info,
            protocol_version,
            connected_at: Utc::now(),
        }
    }

    /// Name of the server this session talks to.
    pub fn server_name(&self) -> &str {
        &self.server
    }

    /// Unique id of this connection (changes on every reconnect).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Invoke `tools/call` and return the raw result object.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        self.channel.request("tools/call", Some(params)).await
    }

    /// Invoke `tools/list`. A reply without a `tools` array yields an empty list.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let value = self.channel.request("tools/list", None).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let parsed: ListToolsResult =
            serde_json::from_value(value).map_err(|e| McpError::TransportError {
                server: self.server.clone(),
                reason: format!("malformed tools/list reply: {e}"),
            })?;
        Ok(parsed.tools)
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Write-once, read-many outcome of one connection attempt.
pub(crate) type SessionFuture = Shared<BoxFuture<'static, Result<Arc<Session>, McpError>>>;

/// Resolves once a connection task has fully exited.
pub(crate) type TaskExit = Shared<BoxFuture<'static, ()>>;

/// Registry bookkeeping for one connection task.
struct Slot {
    generation: u64,
    session: Option<Arc<Session>>,
    pending: SessionFuture,
    close: Option<oneshot::Sender<()>>,
    exited: TaskExit,
    closing: bool,
}

/// What a caller of `get_session` should do next.
pub(crate) enum Lookup {
    /// A published session.
    Ready(Arc<Session>),
    /// A connection task is handshaking; await its future.
    Pending(SessionFuture),
    /// The previous task is tearing down; wait for it, then look again.
    Closing(TaskExit),
    /// The registry has been shut down and starts no new tasks.
    ShutDown,
}

/// Everything needed to start a connection task, handed out by `lookup_or_start`.
pub(crate) struct TaskStart {
    pub generation: u64,
    pub publish: oneshot::Sender<Result<Arc<Session>, McpError>>,
    pub close: oneshot::Receiver<()>,
}

/// Maps server name → live connection task / session.
#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    /// Only written while the slots lock is held.
    shut_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // A panic while holding this lock cannot leave a slot half-written.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Find the server's slot, or atomically create one and start its task.
    ///
    /// `spawn` runs under the registry lock, so the new task cannot touch
    /// its own slot before the slot exists.
    pub(crate) fn lookup_or_start<F>(&self, name: &str, spawn: F) -> Lookup
    where
        F: FnOnce(TaskStart) -> tokio::task::JoinHandle<()>,
    {
        let mut slots = self.slots();
        if self.shut_down.load(Ordering::SeqCst) {
            return Lookup::ShutDown;
        }
        if let Some(slot) = slots.get(name) {
            if slot.closing {
                return Lookup::Closing(slot.exited.clone());
            }
            return match &slot.session {
                Some(session) => Lookup::Ready(Arc::clone(session)),
                None => Lookup::Pending(slot.pending.clone()),
            };
        }

        let generation = next_session_id();
        let (publish_tx, publish_rx) = oneshot::channel();
        let (close_tx, close_rx) = oneshot::channel();

        let server = name.to_string();
        let pending: SessionFuture = publish_rx
            .map(move |outcome| {
                outcome.unwrap_or_else(|_| {
                    Err(McpError::InitFailed {
                        name: server,
                        reason: "connection task exited before publishing a session".into(),
                    })
                })
            })
            .boxed()
            .shared();

        let handle = spawn(TaskStart {
            generation,
            publish: publish_tx,
            close: close_rx,
        });
        let exited: TaskExit = handle.map(|_| ()).boxed().shared();

        slots.insert(
            name.to_string(),
            Slot {
                generation,
                session: None,
                pending: pending.clone(),
                close: Some(close_tx),
                exited,
                closing: false,
            },
        );
        Lookup::Pending(pending)
    }

    /// Publish a session for the slot with the given generation.
    ///
    /// Returns `false` if the slot is gone or closing; the caller must then
    /// tear its connection down instead.
    pub(crate) fn publish(&self, name: &str, generation: u64, session: Arc<Session>) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(name) {
            Some(slot) if slot.generation == generation && !slot.closing => {
                slot.session = Some(session);
                true
            }
            _ => false,
        }
    }

    /// Hide the session from new callers while its task tears down.
    pub(crate) fn unpublish(&self, name: &str, generation: u64) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(name) {
            if slot.generation == generation {
                slot.session = None;
                slot.closing = true;
            }
        }
    }

    /// Remove the slot once its task is done with the transport.
    pub(crate) fn release(&self, name: &str, generation: u64) {
        let mut slots = self.slots();
        if slots.get(name).map(|s| s.generation) == Some(generation) {
            slots.remove(name);
        }
    }

    /// Signal a server's connection task to close.
    ///
    /// With `only_session`, the signal is sent only if that exact session is
    /// still the current one. Returns a future resolving when the task exits.
    pub(crate) fn request_close(&self, name: &str, only_session: Option<u64>) -> Option<TaskExit> {
        let mut slots = self.slots();
        let slot = slots.get_mut(name)?;
        if let Some(id) = only_session {
            let current = slot.session.as_ref().map(|s| s.id());
            if current != Some(id) {
                // Already replaced (or being replaced): just wait out any teardown.
                return slot.closing.then(|| slot.exited.clone());
            }
        }
        Some(Self::signal(slot))
    }

    /// Signal a server's connection task to close unless it was started
    /// after `stamp` (a value drawn from the session id counter).
    ///
    /// A newer task is left running; if it is already closing, its exit
    /// future is still returned so the caller can wait it out.
    pub(crate) fn request_close_older(&self, name: &str, stamp: u64) -> Option<TaskExit> {
        let mut slots = self.slots();
        let slot = slots.get_mut(name)?;
        if slot.generation > stamp {
            return slot.closing.then(|| slot.exited.clone());
        }
        Some(Self::signal(slot))
    }

    /// Refuse all future tasks, then signal every live one to close.
    pub(crate) fn shut_down(&self) -> Vec<(String, TaskExit)> {
        let mut slots = self.slots();
        self.shut_down.store(true, Ordering::SeqCst);
        slots
            .iter_mut()
            .map(|(name, slot)| (name.clone(), Self::signal(slot)))
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn signal(slot: &mut Slot) -> TaskExit {
        slot.closing = true;
        slot.session = None;
        if let Some(close) = slot.close.take() {
            let _ = close.send(());
        }
        slot.exited.clone()
    }

    /// The published session for a server, if any.
    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.slots().get(name).and_then(|s| s.session.clone())
    }

    /// Whether a connection task (connecting, live, or closing) exists for a server.
    pub fn has_task(&self, name: &str) -> bool {
        self.slots().contains_key(name)
    }

    /// Names of servers with a published session, sorted.
    pub fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.session.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of published sessions.
    pub fn session_count(&self) -> usize {
        self.slots().values().filter(|s| s.session.is_some()).count()
    }

    /// Number of slots (connection tasks not yet fully exited).
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullChannel;

    #[async_trait]
    impl RpcChannel for NullChannel {
        async fn request(
            &self,
            method: &str,
            _params: Option<serde_json::Value>,
        ) -> Result<serde_json::Value, McpError> {
            match method {
                "tools/list" => Ok(serde_json::Value::Null),
                _ => Ok(serde_json::json!({"content": []})),
            }
        }

        async fn notify(
            &self,
            _method: &str,
            _params: Option<serde_json::Value>,
        ) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn session(name: &str, id: u64) -> Arc<Session> {
        Arc::new(Session::new(name, id, Arc::new(NullChannel), None, None))
    }

    /// Start a slot whose task waits for close and then releases itself.
    fn start(registry: &Arc<SessionRegistry>, name: &str) -> (u64, Lookup) {
        let mut generation = 0;
        let reg = Arc::clone(registry);
        let server = name.to_string();
        let lookup = registry.lookup_or_start(name, |start| {
            generation = start.generation;
            let TaskStart {
                generation: gen,
                publish,
                close,
            } = start;
            tokio::spawn(async move {
                let s = session(&server, gen);
                reg.publish(&server, gen, Arc::clone(&s));
                let _ = publish.send(Ok(s));
                let _ = close.await;
                reg.unpublish(&server, gen);
                reg.release(&server, gen);
            })
        });
        (generation, lookup)
    }

    #[tokio::test]
    async fn test_lookup_starts_once_and_publishes() {
        let registry = Arc::new(SessionRegistry::new());
        let (generation, lookup) = start(&registry, "alpha");
        let Lookup::Pending(pending) = lookup else {
            panic!("first lookup must start a task");
        };
        let first = pending.await.unwrap();
        assert_eq!(first.id(), generation);

        let (_, again) = start(&registry, "alpha");
        match again {
            Lookup::Ready(s) => assert!(Arc::ptr_eq(&s, &first)),
            _ => panic!("expected the published session"),
        }
        assert_eq!(registry.connected_servers(), vec!["alpha".to_string()]);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_slot() {
        let registry = Arc::new(SessionRegistry::new());
        let (_, lookup) = start(&registry, "alpha");
        if let Lookup::Pending(p) = lookup {
            p.await.unwrap();
        }

        let exited = registry.request_close("alpha", None).unwrap();
        assert!(registry.session("alpha").is_none(), "closing slot hides its session");
        exited.await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_request_close_ignores_replaced_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (_, lookup) = start(&registry, "alpha");
        let Lookup::Pending(p) = lookup else { panic!() };
        let live = p.await.unwrap();

        assert!(registry.request_close("alpha", Some(live.id() + 1000)).is_none());
        assert!(registry.session("alpha").is_some());

        let exits = registry.shut_down();
        assert_eq!(exits.len(), 1);
        for (_, exit) in exits {
            exit.await;
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_request_close_older_keeps_newer_task() {
        let registry = Arc::new(SessionRegistry::new());
        let stamp = next_session_id();
        let (_, lookup) = start(&registry, "alpha");
        let Lookup::Pending(p) = lookup else { panic!() };
        p.await.unwrap();

        assert!(registry.request_close_older("alpha", stamp).is_none());
        assert!(registry.session("alpha").is_some());

        let exited = registry.request_close_older("alpha", next_session_id()).unwrap();
        exited.await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_refuses_new_tasks() {
        let registry = Arc::new(SessionRegistry::new());
        let (_, lookup) = start(&registry, "alpha");
        if let Lookup::Pending(p) = lookup {
            p.await.unwrap();
        }
        for (_, exit) in registry.shut_down() {
            exit.await;
        }
        assert!(registry.is_empty());
        assert!(registry.is_shut_down());

        let mut spawned = false;
        let lookup = registry.lookup_or_start("beta", |_| {
            spawned = true;
            tokio::spawn(async {})
        });
        assert!(matches!(lookup, Lookup::ShutDown));
        assert!(!spawned);
    }

    #[tokio::test]
    async fn test_publish_refused_for_stale_generation() {
        let registry = Arc::new(SessionRegistry::new());
        let (generation, lookup) = start(&registry, "alpha");
        if let Lookup::Pending(p) = lookup {
            p.await.unwrap();
        }
        assert!(!registry.publish("alpha", generation + 1, session("alpha", 99)));
        assert!(!registry.publish("missing", generation, session("missing", 98)));
    }

    #[tokio::test]
    async fn test_session_list_tools_null_is_empty() {
        let s = session("alpha", 1);
        assert!(s.list_tools().await.unwrap().is_empty());
    }
}

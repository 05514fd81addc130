//! Structured telemetry events.
//!
//! Sessions and the executor report lifecycle events through an
//! [`EventSink`]. Emission is fire-and-forget: `emit` returns nothing, and
//! every sink swallows its own delivery failures.

use serde::Serialize;
use tokio::sync::mpsc;

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A session finished its handshake and was published.
    Connected { server: String, session_id: u64 },
    /// A session's connection task tore down its transport.
    Disconnected {
        server: String,
        session_id: u64,
        reason: String,
    },
    /// One connection attempt inside a restart.
    RestartAttempt {
        server: String,
        attempt: u32,
        success: bool,
        /// Wait before the next attempt (0 when none follows).
        backoff_ms: u64,
        error: Option<String>,
    },
    /// An execution attempt of a step began.
    StepStarted {
        step_id: String,
        attempt: u32,
        action: String,
    },
    /// An execution attempt of a step ended (after verification, if any).
    StepFinished {
        step_id: String,
        attempt: u32,
        success: bool,
        error: Option<String>,
    },
}

/// Receiver of lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::debug!(target: "deskpilot::events", event = %json, "event"),
            Err(e) => tracing::debug!(target: "deskpilot::events", error = %e, "event not serializable"),
        }
    }
}

/// Forwards events into an unbounded channel (UI bridges, tests).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

/// Drain everything currently buffered in a receiver.
#[cfg(test)]
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

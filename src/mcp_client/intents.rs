//! Static intent table: logical tool intents resolved to `(server, tool)`.
//!
//! Plans may name an intent ("open_url") instead of a concrete server and
//! tool. The mapping comes from the servers file and is checked once at load
//! time, so a typo surfaces at startup rather than mid-run.

use std::collections::HashMap;

use super::errors::McpError;
use super::types::{IntentTarget, McpServersConfig};

/// Validated `intent → (server, tool)` table.
#[derive(Debug, Clone, Default)]
pub struct IntentMap {
    targets: HashMap<String, IntentTarget>,
}

impl IntentMap {
    /// Build the table, rejecting intents whose server is unknown or disabled.
    pub fn from_config(config: &McpServersConfig) -> Result<Self, McpError> {
        let mut problems = Vec::new();
        for (intent, target) in &config.intents {
            if target.tool.trim().is_empty() {
                problems.push(format!("intent '{intent}' has an empty tool"));
                continue;
            }
            match config.servers.get(&target.server) {
                None => problems.push(format!(
                    "intent '{intent}' targets unknown server '{}'",
                    target.server
                )),
                Some(server) if server.disabled => problems.push(format!(
                    "intent '{intent}' targets disabled server '{}'",
                    target.server
                )),
                Some(_) => {}
            }
        }

        if !problems.is_empty() {
            problems.sort();
            return Err(McpError::ConfigError {
                reason: problems.join("; "),
            });
        }

        Ok(Self {
            targets: config.intents.clone(),
        })
    }

    pub fn resolve(&self, intent: &str) -> Option<&IntentTarget> {
        self.targets.get(intent)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

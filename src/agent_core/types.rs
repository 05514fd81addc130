//! Shared types for the agent core.
//!
//! Plan steps, per-attempt results, verifier verdicts and the execution
//! context threaded through recursive runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mcp_client::types::ToolErrorKind;

// ─── Steps ───────────────────────────────────────────────────────────────────

/// One planned action: a single tool call plus what its outcome should look like.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Hierarchical id ("1", "3.2"). Assigned by the engine; any planned value is overwritten.
    #[serde(default)]
    pub id: String,
    /// Human-readable description of the action.
    #[serde(default)]
    pub action: String,
    #[serde(default, alias = "server")]
    pub target_server: Option<String>,
    #[serde(default, alias = "tool")]
    pub target_tool: Option<String>,
    /// Logical intent, resolved through the static intent table when no server/tool is given.
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub expected_result: String,
    #[serde(default)]
    pub requires_verification: bool,
    /// Pre-planned alternatives offered to recovery when this step is exhausted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback: Vec<Step>,
}

impl Step {
    /// A step calling `server.tool` directly.
    pub fn tool_call(action: &str, server: &str, tool: &str, args: serde_json::Value) -> Self {
        Self {
            action: action.to_string(),
            target_server: Some(server.to_string()),
            target_tool: Some(tool.to_string()),
            args,
            ..Default::default()
        }
    }

    pub fn with_verification(mut self, expected_result: &str) -> Self {
        self.requires_verification = true;
        self.expected_result = expected_result.to_string();
        self
    }
}

/// Lifecycle state of a step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Attempting,
    Escalating,
    Recovering,
    Succeeded,
    Failed,
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// Outcome of one attempt of one step. Appended to the history once per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub action: String,
    pub attempt: u32,
    pub success: bool,
    /// Flattened tool output.
    pub output: String,
    pub error: Option<String>,
    /// Failure category when the tool call itself failed.
    #[serde(default)]
    pub error_kind: Option<ToolErrorKind>,
    pub finished_at: DateTime<Utc>,
}

/// Verifier verdict on a successful attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub verified: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Verification {
    pub fn accepted(description: &str) -> Self {
        Self {
            verified: true,
            description: description.to_string(),
            issues: Vec::new(),
        }
    }

    pub fn rejected(description: &str, issues: Vec<String>) -> Self {
        Self {
            verified: false,
            description: description.to_string(),
            issues,
        }
    }

    /// Error text recorded for a rejected attempt.
    pub fn rejection_message(&self) -> String {
        let mut message = format!("verifier rejected: {}", self.description);
        if !self.issues.is_empty() {
            message.push_str(&format!(" Issues: {}", self.issues.join(", ")));
        }
        message
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Per-run state owned by the current execution call chain.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    /// Current recovery nesting depth (0 at top level).
    pub depth: usize,
    /// Every attempt so far, in order.
    pub history: Vec<StepResult>,
    /// Ids from the top-level step down to the step being run.
    pub chain: Vec<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            depth: 0,
            history: Vec::new(),
            chain: Vec::new(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute a step id from its parent prefix and zero-based position.
pub fn child_id(parent: &str, index: usize) -> String {
    if parent.is_empty() {
        (index + 1).to_string()
    } else {
        format!("{parent}.{}", index + 1)
    }
}

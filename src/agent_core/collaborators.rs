//! External collaborators of the execution engine.
//!
//! Plan content, verification verdicts, recovery alternatives and argument
//! corrections are produced elsewhere (usually by models). The engine only
//! sees these traits. Declarative implementations used by the CLI and tests
//! live here too.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{Step, StepResult, Verification};
use crate::mcp_client::types::{IntentTarget, ToolCallResult};
use crate::mcp_client::McpClient;

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Issues tool calls on behalf of the engine.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Call a tool. Failures are returned as data.
    async fn call_tool(&self, server: &str, tool: &str, args: serde_json::Value) -> ToolCallResult;

    /// Resolve a logical intent to a concrete server and tool.
    fn resolve_intent(&self, intent: &str) -> Option<IntentTarget>;
}

/// Produces the initial plan for a request. Consumed once per run.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &str) -> anyhow::Result<Vec<Step>>;
}

/// Judges whether a successful attempt actually achieved its step.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, step: &Step, result: &StepResult) -> anyhow::Result<Verification>;
}

/// Offers alternative substeps for a step that exhausted its attempts.
#[async_trait]
pub trait Recovery: Send + Sync {
    /// An empty list means there is no alternative.
    async fn recover(&self, failed: &Step, error: &str) -> anyhow::Result<Vec<Step>>;
}

/// Corrects a step after a hard failure.
#[async_trait]
pub trait ArgumentFixer: Send + Sync {
    /// `None` keeps the step unchanged.
    async fn fix(&self, step: &Step, error: &str) -> Option<Step>;
}

#[async_trait]
impl ToolInvoker for McpClient {
    async fn call_tool(&self, server: &str, tool: &str, args: serde_json::Value) -> ToolCallResult {
        McpClient::call_tool(self, server, tool, args).await
    }

    fn resolve_intent(&self, intent: &str) -> Option<IntentTarget> {
        McpClient::resolve_intent(self, intent).cloned()
    }
}

// ─── Declarative Implementations ─────────────────────────────────────────────

/// Returns a fixed plan.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    steps: Vec<Step>,
}

impl StaticPlanner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _request: &str) -> anyhow::Result<Vec<Step>> {
        Ok(self.steps.clone())
    }
}

/// Accepts a result when the step's `expected_result` appears in its output.
///
/// Matching is case-insensitive; an empty expectation accepts anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectedOutputVerifier;

#[async_trait]
impl Verifier for ExpectedOutputVerifier {
    async fn verify(&self, step: &Step, result: &StepResult) -> anyhow::Result<Verification> {
        let expected = step.expected_result.trim();
        if expected.is_empty() {
            return Ok(Verification::accepted("no expectation"));
        }
        if result.output.to_lowercase().contains(&expected.to_lowercase()) {
            Ok(Verification::accepted(&format!("output mentions '{expected}'")))
        } else {
            Ok(Verification::rejected(
                &format!("output does not mention '{expected}'"),
                Vec::new(),
            ))
        }
    }
}

/// Recovers with the step's pre-planned `fallback` substeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlannedRecovery;

#[async_trait]
impl Recovery for PlannedRecovery {
    async fn recover(&self, failed: &Step, _error: &str) -> anyhow::Result<Vec<Step>> {
        Ok(failed.fallback.clone())
    }
}

/// Never offers an alternative.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecovery;

#[async_trait]
impl Recovery for NoRecovery {
    async fn recover(&self, _failed: &Step, _error: &str) -> anyhow::Result<Vec<Step>> {
        Ok(Vec::new())
    }
}

/// Asks a tool for corrected arguments with a single call.
///
/// The tool receives `{"action", "server", "tool", "args", "error"}` and
/// must answer with a JSON object of replacement arguments.
pub struct ToolArgumentFixer {
    tools: Arc<dyn ToolInvoker>,
    server: String,
    tool: String,
}

impl ToolArgumentFixer {
    pub fn new(tools: Arc<dyn ToolInvoker>, server: &str, tool: &str) -> Self {
        Self {
            tools,
            server: server.to_string(),
            tool: tool.to_string(),
        }
    }
}

#[async_trait]
impl ArgumentFixer for ToolArgumentFixer {
    async fn fix(&self, step: &Step, error: &str) -> Option<Step> {
        let request = serde_json::json!({
            "action": step.action,
            "server": step.target_server,
            "tool": step.target_tool,
            "args": step.args,
            "error": error,
        });
        let result = self.tools.call_tool(&self.server, &self.tool, request).await;
        if !result.success {
            tracing::debug!(error = ?result.error, "executor: argument fixer failed");
            return None;
        }

        let text = result.text();
        let args: serde_json::Value = serde_json::from_str(extract_json_object(&text)).ok()?;
        if !args.is_object() || args == step.args {
            return None;
        }
        Some(Step {
            args,
            ..step.clone()
        })
    }
}

/// Slice the outermost `{...}` out of text that may carry prose or fences.
fn extract_json_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(output: &str) -> StepResult {
        StepResult {
            step_id: "1".into(),
            action: "open notes".into(),
            attempt: 1,
            success: true,
            output: output.into(),
            error: None,
            error_kind: None,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_expected_output_verifier() {
        let step = Step::default().with_verification("Notes Opened");
        let verifier = ExpectedOutputVerifier;

        assert!(verifier.verify(&step, &result("app notes opened at 10:02")).await.unwrap().verified);
        let verdict = verifier.verify(&step, &result("permission denied")).await.unwrap();
        assert!(!verdict.verified);

        let no_expectation = Step::default();
        assert!(verifier.verify(&no_expectation, &result("")).await.unwrap().verified);
    }

    #[tokio::test]
    async fn test_planned_recovery_returns_fallback() {
        let mut step = Step::tool_call("open", "apps", "open", serde_json::json!({}));
        step.fallback = vec![Step::tool_call("open via shell", "terminal", "run", serde_json::json!({}))];
        let alternatives = PlannedRecovery.recover(&step, "boom").await.unwrap();
        assert_eq!(alternatives.len(), 1);
        assert_eq!(alternatives[0].target_server.as_deref(), Some("terminal"));
        assert!(NoRecovery.recover(&step, "boom").await.unwrap().is_empty());
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(extract_json_object("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json_object("no json"), "no json");
    }
}

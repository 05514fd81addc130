//! Plan file parsing.
//!
//! Accepts either a plan object `{"goal": "...", "steps": [...]}` or a bare
//! array of steps. Text around the JSON (markdown fences, a model's preamble)
//! is ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::AgentError;
use super::types::Step;

/// A parsed plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub goal: String,
    pub steps: Vec<Step>,
}

/// Parse plan text.
pub fn parse_plan(text: &str) -> Result<Plan, AgentError> {
    let json_str = extract_json(text);
    let plan = if json_str.starts_with('[') {
        Plan {
            goal: String::new(),
            steps: serde_json::from_str(json_str)?,
        }
    } else {
        serde_json::from_str::<Plan>(json_str)?
    };

    if plan.steps.is_empty() {
        return Err(AgentError::InvalidPlan {
            reason: "plan has no steps".into(),
        });
    }
    Ok(plan)
}

/// Read and parse a plan file.
pub fn load_plan(path: &Path) -> Result<Plan, AgentError> {
    let text = std::fs::read_to_string(path).map_err(|e| AgentError::InvalidPlan {
        reason: format!("cannot read {}: {e}", path.display()),
    })?;
    let plan = parse_plan(&text)?;
    tracing::info!(path = %path.display(), steps = plan.steps.len(), goal = %plan.goal, "loaded plan file");
    Ok(plan)
}

/// Extract the outermost JSON object or array from text that may be wrapped in code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let (open, close) = match (trimmed.find('{'), trimmed.find('[')) {
        (Some(o), Some(a)) if a < o => ('[', ']'),
        (None, Some(_)) => ('[', ']'),
        _ => ('{', '}'),
    };
    if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

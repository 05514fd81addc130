//! Agent Core error types.

use thiserror::Error;

/// Errors that abort a plan run.
///
/// Step-level failures never surface here directly: they are retried and
/// escalated to recovery first. Only what recovery cannot resolve ends up
/// as an `AgentError`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    /// Recovery nested deeper than the configured cap.
    #[error("recursion depth exceeded at step '{step_id}' (chain: {})", chain.join(" > "))]
    RecursionDepthExceeded {
        /// The step whose recovery would have gone too deep.
        step_id: String,
        /// Ancestor ids from the top-level step down to `step_id`.
        chain: Vec<String>,
    },

    /// A step exhausted its attempts and recovery offered nothing.
    #[error("step '{step_id}' failed: {last_error}")]
    StepFailed { step_id: String, last_error: String },

    /// The planner could not produce a plan.
    #[error("planning failed: {reason}")]
    PlanningFailed { reason: String },

    /// A plan (or plan file) is malformed.
    #[error("invalid plan: {reason}")]
    InvalidPlan { reason: String },
}

impl AgentError {
    /// The step id the failure is attributed to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            AgentError::RecursionDepthExceeded { step_id, .. }
            | AgentError::StepFailed { step_id, .. } => Some(step_id),
            AgentError::PlanningFailed { .. } | AgentError::InvalidPlan { .. } => None,
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::InvalidPlan {
            reason: e.to_string(),
        }
    }
}

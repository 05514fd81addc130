//! Per-step retry policy: transient vs hard failure classification.
//!
//! Transient failures (dead pipes, timeouts, rate limits) are retried
//! unchanged after a short growing delay. Hard failures (bad arguments,
//! logic errors) may be routed through an argument fixer first.

use std::time::Duration;

use crate::config::ExecutionSettings;
use crate::mcp_client::types::{ToolCallResult, ToolErrorKind};

/// Error fragments that mark a tool-level failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "timeout",
    "timed out",
    "rate limit",
    "broken pipe",
    "connection reset",
];

/// How a failed attempt should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry unchanged after a short delay.
    Transient,
    /// Retry after (optionally) correcting the step.
    Hard,
}

/// Attempt budget and classification rules for one step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub transient_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            max_attempts: settings.max_step_attempts.max(1),
            transient_delay: Duration::from_millis(settings.transient_retry_delay_ms),
        }
    }

    /// Classify a failed tool call.
    pub fn classify(result: &ToolCallResult) -> FailureClass {
        match result.error_kind {
            Some(ToolErrorKind::Connection)
            | Some(ToolErrorKind::Timeout)
            | Some(ToolErrorKind::TransportClosed) => FailureClass::Transient,
            _ => Self::classify_message(result.error.as_deref().unwrap_or_default()),
        }
    }

    /// Classify a bare error message.
    pub fn classify_message(error: &str) -> FailureClass {
        let lower = error.to_lowercase();
        if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
            FailureClass::Transient
        } else {
            FailureClass::Hard
        }
    }

    /// Delay before the attempt following `attempt`, for transient failures.
    pub fn transient_delay(&self, attempt: u32) -> Duration {
        self.transient_delay.saturating_mul(attempt)
    }

    /// Whether another attempt follows `attempt`.
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

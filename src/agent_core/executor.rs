//! Recursive plan execution engine.
//!
//! Runs an ordered list of steps strictly in sequence. Each step gets a
//! bounded number of attempts; transient failures are retried unchanged,
//! hard failures may be corrected by an [`ArgumentFixer`] first. A step
//! that exhausts its attempts escalates to the [`Recovery`] collaborator,
//! whose substeps run recursively under the failed step's id ("3" →
//! "3.1", "3.2"). Nesting beyond `max_depth` aborts the whole run.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use uuid::Uuid;

use super::collaborators::{ArgumentFixer, Planner, Recovery, ToolInvoker, Verifier};
use super::errors::AgentError;
use super::history::golden_path;
use super::retry::{FailureClass, RetryPolicy};
use super::types::{child_id, ExecutionContext, Step, StepResult, StepState};
use crate::config::ExecutionSettings;
use crate::events::{Event, EventSink, TracingSink};
use crate::mcp_client::types::{ToolCallResult, ToolErrorKind};

// ─── Run Outcome ─────────────────────────────────────────────────────────────

/// A completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Every attempt, in execution order.
    pub history: Vec<StepResult>,
    /// Last successful result per step id, in id order.
    pub golden_path: Vec<StepResult>,
}

/// An aborted run, with the history accumulated up to the failure.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub error: AgentError,
    pub history: Vec<StepResult>,
}

/// Outcome of one attempt, before it is recorded.
struct Attempt {
    success: bool,
    output: String,
    error: Option<String>,
    error_kind: Option<ToolErrorKind>,
    class: FailureClass,
}

impl Attempt {
    fn failed(error: String, kind: Option<ToolErrorKind>, class: FailureClass) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            error_kind: kind,
            class,
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Runs plans against a tool facade.
pub struct ExecutionEngine {
    tools: Arc<dyn ToolInvoker>,
    verifier: Arc<dyn Verifier>,
    recovery: Arc<dyn Recovery>,
    fixer: Option<Arc<dyn ArgumentFixer>>,
    events: Arc<dyn EventSink>,
    settings: ExecutionSettings,
    policy: RetryPolicy,
}

impl ExecutionEngine {
    pub fn new(
        tools: Arc<dyn ToolInvoker>,
        verifier: Arc<dyn Verifier>,
        recovery: Arc<dyn Recovery>,
        settings: ExecutionSettings,
    ) -> Self {
        let policy = RetryPolicy::from_settings(&settings);
        Self {
            tools,
            verifier,
            recovery,
            fixer: None,
            events: Arc::new(TracingSink),
            settings,
            policy,
        }
    }

    /// Correct steps after hard failures with `fixer`.
    pub fn with_fixer(mut self, fixer: Arc<dyn ArgumentFixer>) -> Self {
        self.fixer = Some(fixer);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Ask the planner for steps once, then run them.
    pub async fn run_request(
        &self,
        planner: &dyn Planner,
        request: &str,
    ) -> Result<RunReport, RunFailure> {
        let steps = planner.plan(request).await.map_err(|e| RunFailure {
            run_id: Uuid::new_v4(),
            error: AgentError::PlanningFailed {
                reason: e.to_string(),
            },
            history: Vec::new(),
        })?;
        if steps.is_empty() {
            return Err(RunFailure {
                run_id: Uuid::new_v4(),
                error: AgentError::PlanningFailed {
                    reason: "planner returned no steps".into(),
                },
                history: Vec::new(),
            });
        }
        self.run(steps).await
    }

    /// Run a top-level plan.
    pub async fn run(&self, steps: Vec<Step>) -> Result<RunReport, RunFailure> {
        let mut ctx = ExecutionContext::new();
        tracing::info!(run_id = %ctx.run_id, steps = steps.len(), "executor: run started");

        match self.run_steps(steps, String::new(), &mut ctx).await {
            Ok(()) => {
                let golden = golden_path(&ctx.history);
                tracing::info!(
                    run_id = %ctx.run_id,
                    attempts = ctx.history.len(),
                    golden_steps = golden.len(),
                    "executor: run completed"
                );
                Ok(RunReport {
                    run_id: ctx.run_id,
                    history: ctx.history,
                    golden_path: golden,
                })
            }
            Err(error) => {
                tracing::error!(run_id = %ctx.run_id, error = %error, "executor: run aborted");
                Err(RunFailure {
                    run_id: ctx.run_id,
                    error,
                    history: ctx.history,
                })
            }
        }
    }

    /// Run one list of steps under `parent`, at the context's current depth.
    fn run_steps<'a>(
        &'a self,
        steps: Vec<Step>,
        parent: String,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<(), AgentError>> {
        async move {
            if ctx.depth > self.settings.max_depth {
                tracing::error!(
                    step_id = %parent,
                    depth = ctx.depth,
                    max_depth = self.settings.max_depth,
                    "executor: recovery nested too deep"
                );
                return Err(AgentError::RecursionDepthExceeded {
                    step_id: parent,
                    chain: ctx.chain.clone(),
                });
            }

            for (index, mut step) in steps.into_iter().enumerate() {
                step.id = child_id(&parent, index);
                ctx.chain.push(step.id.clone());
                let outcome = self.run_step(step, ctx).await;
                ctx.chain.pop();
                outcome?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Attempt a step until it succeeds or its budget runs out, then escalate.
    async fn run_step(&self, mut step: Step, ctx: &mut ExecutionContext) -> Result<(), AgentError> {
        let id = step.id.clone();
        trace_state(&id, StepState::Pending);

        let mut attempt = 1;
        let last_error = loop {
            trace_state(&id, StepState::Attempting);
            self.events.emit(Event::StepStarted {
                step_id: id.clone(),
                attempt,
                action: step.action.clone(),
            });
            tracing::info!(step_id = %id, attempt, action = %step.action, "executor: attempting step");

            let outcome = self.attempt(&step, attempt).await;
            let result = StepResult {
                step_id: id.clone(),
                action: step.action.clone(),
                attempt,
                success: outcome.success,
                output: outcome.output,
                error: outcome.error.clone(),
                error_kind: outcome.error_kind,
                finished_at: Utc::now(),
            };
            ctx.history.push(result);
            self.events.emit(Event::StepFinished {
                step_id: id.clone(),
                attempt,
                success: outcome.success,
                error: outcome.error.clone(),
            });

            if outcome.success {
                trace_state(&id, StepState::Succeeded);
                return Ok(());
            }

            let error = outcome.error.unwrap_or_default();
            tracing::warn!(step_id = %id, attempt, class = ?outcome.class, %error, "executor: attempt failed");

            if !self.policy.has_next(attempt) {
                break error;
            }
            match outcome.class {
                FailureClass::Transient => {
                    let delay = self.policy.transient_delay(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                FailureClass::Hard => {
                    if let Some(fixer) = &self.fixer {
                        if let Some(mut fixed) = fixer.fix(&step, &error).await {
                            tracing::info!(step_id = %id, "executor: retrying with corrected step");
                            fixed.id = id.clone();
                            step = fixed;
                        }
                    }
                }
            }
            attempt += 1;
        };

        self.escalate(step, last_error, ctx).await
    }

    /// Ask recovery for substeps and run them one level deeper.
    async fn escalate(
        &self,
        step: Step,
        last_error: String,
        ctx: &mut ExecutionContext,
    ) -> Result<(), AgentError> {
        let id = step.id.clone();
        trace_state(&id, StepState::Escalating);
        tracing::warn!(step_id = %id, attempts = self.policy.max_attempts, "executor: step exhausted, escalating to recovery");

        let alternatives = match self.recovery.recover(&step, &last_error).await {
            Ok(steps) => steps,
            Err(e) => {
                tracing::warn!(step_id = %id, error = %e, "executor: recovery failed");
                Vec::new()
            }
        };

        if alternatives.is_empty() {
            trace_state(&id, StepState::Failed);
            return Err(AgentError::StepFailed {
                step_id: id,
                last_error,
            });
        }

        trace_state(&id, StepState::Recovering);
        tracing::info!(step_id = %id, substeps = alternatives.len(), depth = ctx.depth + 1, "executor: running recovery steps");

        ctx.depth += 1;
        let outcome = self.run_steps(alternatives, id.clone(), ctx).await;
        ctx.depth -= 1;

        match outcome {
            Ok(()) => {
                trace_state(&id, StepState::Succeeded);
                tracing::info!(step_id = %id, "executor: step resolved by recovery");
                Ok(())
            }
            Err(e) => {
                trace_state(&id, StepState::Failed);
                Err(e)
            }
        }
    }

    /// One attempt, bounded by the step timeout (zero disables it).
    async fn attempt(&self, step: &Step, attempt: u32) -> Attempt {
        let timeout = self.settings.step_timeout();
        if timeout.is_zero() {
            return self.attempt_inner(step, attempt).await;
        }
        match tokio::time::timeout(timeout, self.attempt_inner(step, attempt)).await {
            Ok(outcome) => outcome,
            Err(_) => Attempt::failed(
                format!("step timed out after {}ms", timeout.as_millis()),
                Some(ToolErrorKind::Timeout),
                FailureClass::Transient,
            ),
        }
    }

    async fn attempt_inner(&self, step: &Step, attempt: u32) -> Attempt {
        let (server, tool) = match self.resolve_target(step) {
            Ok(target) => target,
            Err(error) => {
                return Attempt::failed(error, Some(ToolErrorKind::Config), FailureClass::Hard)
            }
        };

        let result: ToolCallResult = self.tools.call_tool(&server, &tool, step.args.clone()).await;
        if !result.success {
            return Attempt::failed(
                result.error.clone().unwrap_or_else(|| "tool call failed".into()),
                result.error_kind,
                RetryPolicy::classify(&result),
            );
        }

        let output = result.text();
        if !step.requires_verification {
            return Attempt {
                success: true,
                output,
                error: None,
                error_kind: None,
                class: FailureClass::Hard,
            };
        }

        let candidate = StepResult {
            step_id: step.id.clone(),
            action: step.action.clone(),
            attempt,
            success: true,
            output: output.clone(),
            error: None,
            error_kind: None,
            finished_at: Utc::now(),
        };
        let error = match self.verifier.verify(step, &candidate).await {
            Ok(verdict) if verdict.verified => {
                return Attempt {
                    success: true,
                    output,
                    error: None,
                    error_kind: None,
                    class: FailureClass::Hard,
                };
            }
            Ok(verdict) => verdict.rejection_message(),
            Err(e) => format!("verification system error: {e}"),
        };
        tracing::info!(step_id = %step.id, %error, "executor: verification rejected result");
        Attempt {
            success: false,
            output,
            error: Some(error),
            error_kind: None,
            class: FailureClass::Hard,
        }
    }

    /// Concrete `(server, tool)` for a step: explicit target first, then intent.
    fn resolve_target(&self, step: &Step) -> Result<(String, String), String> {
        if let (Some(server), Some(tool)) = (&step.target_server, &step.target_tool) {
            return Ok((server.clone(), tool.clone()));
        }
        match &step.intent {
            Some(intent) => self
                .tools
                .resolve_intent(intent)
                .map(|t| (t.server, t.tool))
                .ok_or_else(|| format!("unknown intent '{intent}'")),
            None => Err("step names neither a server/tool nor an intent".into()),
        }
    }
}

fn trace_state(step_id: &str, state: StepState) {
    tracing::trace!(step_id, state = ?state, "executor: step state");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Agent Core: recursive plan execution over the tool-server facade.
//!
//! Submodules:
//! - `executor`: Recursive step runner with recovery escalation and a depth cap
//! - `retry`: Per-step attempt budget, transient vs hard classification
//! - `history`: Golden-path compression of the execution history
//! - `collaborators`: Planner / verifier / recovery / fixer traits and declarative impls
//! - `plan_parser`: Plan file parsing
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod collaborators;
pub mod errors;
pub mod executor;
pub mod history;
pub mod plan_parser;
pub mod retry;
pub mod types;

// Re-exports for convenience
pub use collaborators::{
    ArgumentFixer, ExpectedOutputVerifier, NoRecovery, PlannedRecovery, Planner, Recovery,
    StaticPlanner, ToolArgumentFixer, ToolInvoker, Verifier,
};
pub use errors::AgentError;
pub use executor::{ExecutionEngine, RunFailure, RunReport};
pub use history::golden_path;
pub use plan_parser::{load_plan, parse_plan, Plan};
pub use retry::{FailureClass, RetryPolicy};
pub use types::{ExecutionContext, Step, StepResult, StepState, Verification};

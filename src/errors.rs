//! Typed error hierarchy for the Delve orchestration kernel.
//!
//! One enum per subsystem:
//! - `LlmError` — chat provider failures (timeout, cancel, bad response)
//! - `LogError` — event log append failures (always fatal to the caller)
//! - `ToolError` — tool executor failures, recorded as failed step results
//! - `PlannerError` — fatal planning-loop failures
//! - `DecompositionError` — invalid decomposition output or sub-query cycles
//! - `StoreError` — research-result persistence failures (logged, not fatal)
//! - `OrchestratorError` — session-level failures surfaced at the entry point

use thiserror::Error;

/// Errors from an LLM chat provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("LLM call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("LLM call cancelled")]
    Cancelled,

    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("Unknown LLM provider '{0}'")]
    UnknownProvider(String),
}

/// Errors from the event log store. Append failures are fatal to the calling
/// operation: the kernel refuses to silently drop its audit trail.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Failed to append log entry: {0}")]
    Append(String),

    #[error("Failed to query log entries: {0}")]
    Query(String),
}

/// Errors from a tool executor. The step executor translates these into
/// failed step results; they never propagate as `Err` past it.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },

    #[error("No executor registered for tool '{0}'")]
    UnknownTool(String),

    #[error("Tool '{tool}' timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("Tool invocation cancelled")]
    Cancelled,
}

impl ToolError {
    /// Check whether this error came from cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Fatal failures of the planning loop.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("Planning failed: no plan created")]
    NoPlanCreated,

    #[error("create_plan limit exceeded after {attempts} attempts")]
    CreatePlanLimitExceeded { attempts: u32 },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Failures of one decomposition invocation.
#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("Invalid decomposition response: {0}")]
    InvalidResponse(String),

    #[error("Circular dependency among sub-queries: {remaining:?}")]
    CircularDependency { remaining: Vec<String> },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Errors from the research-result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Persistence failure: {0}")]
    Persistence(String),
}

/// Session-level errors surfaced at the orchestrator entry points. Every one
/// of these is preceded by a `session_failed` event on the log stream.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session {session_id} aborted: {reason}")]
    Aborted { session_id: String, reason: String },

    #[error("Session cancelled")]
    Cancelled,

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Decomposition(#[from] DecompositionError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Log(#[from] LogError),
}

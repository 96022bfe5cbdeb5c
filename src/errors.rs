//! Typed error hierarchy for the conductor.
//!
//! Four top-level enums cover the four subsystems:
//! - `OrchestratorError` — run lifecycle and safety-limit failures
//! - `PolicyError` — malformed policies, rejected at construction
//! - `ApprovalError` — approval store and exec-approval failures
//! - `HandoffError` — handoff package persistence failures
//!
//! Policy denials and approval denials/timeouts are *not* errors; they are
//! values (`Decision`, `ApprovalOutcome`) the caller must match on.

use thiserror::Error;

/// Errors from the workflow orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Workflow definition '{workflow_type}' is not registered")]
    DefinitionNotFound { workflow_type: String },

    #[error("Invalid workflow definition '{workflow_type}': {message}")]
    InvalidDefinition {
        workflow_type: String,
        message: String,
    },

    #[error("Workflow run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Workflow exceeded maxDurationMs: limit {limit_ms}ms, elapsed {elapsed_ms}ms")]
    WorkflowTimeout { limit_ms: u64, elapsed_ms: u64 },

    #[error(
        "Agent run limit exceeded (maxAgentRuns): limit {limit}, attempted run {attempted} in phase {phase}"
    )]
    AgentRunLimitExceeded {
        limit: u32,
        attempted: u32,
        phase: String,
    },

    #[error("Planned task count exceeds maxTasks: limit {limit}, observed {observed}")]
    MaxTasksExceeded { limit: u32, observed: u32 },

    #[error("Phase {phase} failed after {attempts} attempt(s): {message}")]
    PhaseFailed {
        phase: String,
        attempts: u32,
        message: String,
    },

    #[error("Phase {phase} is missing artifact '{artifact}'")]
    ArtifactMissing { phase: String, artifact: String },

    #[error("Success criterion for phase {phase} not met: {condition}")]
    CriterionNotMet { phase: String, condition: String },

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },

    #[error("Run {run_id} was aborted")]
    Aborted { run_id: String },

    #[error("Persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("Workspace setup failed: {0:#}")]
    Workspace(#[source] anyhow::Error),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),
}

impl OrchestratorError {
    /// Safety-limit errors are fatal to the run and never retried.
    pub fn is_safety_limit(&self) -> bool {
        matches!(
            self,
            Self::WorkflowTimeout { .. }
                | Self::AgentRunLimitExceeded { .. }
                | Self::MaxTasksExceeded { .. }
        )
    }
}

/// Errors raised while building a policy engine.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Rule {rule_id} has an invalid {kind} pattern '{pattern}': {message}")]
    InvalidPattern {
        rule_id: String,
        kind: &'static str,
        pattern: String,
        message: String,
    },

    #[error("Duplicate policy rule id '{0}'")]
    DuplicateRule(String),

    #[error("Invalid path scope: {0}")]
    InvalidScope(String),
}

/// Errors from the approval subsystem.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Approval log I/O failed at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize approval record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Approval store lock poisoned")]
    LockPoisoned,

    #[error("Approval request {0} not found")]
    UnknownRequest(String),

    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),
}

/// Errors from handoff package persistence.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Failed to write handoff file {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read handoff file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed handoff file: {0}")]
    Malformed(#[from] serde_json::Error),
}

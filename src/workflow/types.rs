use crate::errors::OrchestratorError;
use crate::policy::WorkflowPolicy;
use crate::workflow::definition::EngineRole;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    /// Forward-only; terminal states are sinks.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Pending, RunStatus::Aborted)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub task: String,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl WorkflowInput {
    pub fn new(task: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            task: task.into(),
            repo_path: repo_path.into(),
            context: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceMode {
    /// Work directly in the target repository
    #[default]
    InPlace,
    /// A git worktree under the run directory
    Worktree,
    /// A plain copy of the repository without `.git`
    Copy,
}

impl std::fmt::Display for WorkspaceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceMode::InPlace => write!(f, "in-place"),
            WorkspaceMode::Worktree => write!(f, "worktree"),
            WorkspaceMode::Copy => write!(f, "copy"),
        }
    }
}

impl FromStr for WorkspaceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-place" | "in_place" | "inplace" => Ok(WorkspaceMode::InPlace),
            "worktree" => Ok(WorkspaceMode::Worktree),
            "copy" => Ok(WorkspaceMode::Copy),
            _ => anyhow::bail!(
                "Invalid workspace mode '{}'. Valid options: in-place, worktree, copy",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub mode: WorkspaceMode,
    pub repo_path: PathBuf,
}

impl WorkspaceConfig {
    pub fn in_place(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            mode: WorkspaceMode::InPlace,
            repo_path: repo_path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Failed => write!(f, "failed"),
            PhaseStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One concluded phase. Appended to the history only once the phase ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub phase_id: String,
    pub engine: EngineRole,
    pub iteration: u32,
    pub attempts: u32,
    pub status: PhaseStatus,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_type: String,
    pub status: RunStatus,
    pub input: WorkflowInput,
    pub workspace: WorkspaceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    /// Live runs call the agent runner; stub runs substitute fixed output.
    pub live: bool,
    #[serde(default)]
    pub policy: WorkflowPolicy,
    #[serde(default)]
    pub phase_history: Vec<PhaseExecution>,
    #[serde(default)]
    pub agent_run_count: u32,
    #[serde(default)]
    pub review_iterations: u32,
    #[serde(default)]
    pub review_iterations_exhausted: bool,
    #[serde(default)]
    pub approval_count: u32,
    pub created_at_ms: i64,
    pub started_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn new(
        workflow_type: &str,
        input: WorkflowInput,
        workspace: WorkspaceConfig,
        live: bool,
        policy: WorkflowPolicy,
        now_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_type: workflow_type.to_string(),
            status: RunStatus::Pending,
            input,
            workspace,
            workspace_path: None,
            live,
            policy,
            phase_history: Vec::new(),
            agent_run_count: 0,
            review_iterations: 0,
            review_iterations_exhausted: false,
            approval_count: 0,
            created_at_ms: now_ms,
            started_at_ms: now_ms,
            updated_at_ms: now_ms,
            finished_at_ms: None,
            error: None,
        }
    }

    pub fn transition(&mut self, next: RunStatus, now_ms: i64) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                run_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at_ms = now_ms;
        if next == RunStatus::Running {
            self.started_at_ms = now_ms;
        }
        if next.is_terminal() {
            self.finished_at_ms = Some(now_ms);
        }
        Ok(())
    }

    /// Most recent completed execution of `phase_id`.
    pub fn latest_completed(&self, phase_id: &str) -> Option<&PhaseExecution> {
        self.phase_history
            .iter()
            .rev()
            .find(|p| p.phase_id == phase_id && p.status == PhaseStatus::Completed)
    }

    /// Most recent completed execution that produced `artifact`.
    pub fn latest_producer(&self, artifact: &str) -> Option<&PhaseExecution> {
        self.phase_history
            .iter()
            .rev()
            .find(|p| p.status == PhaseStatus::Completed && p.artifacts.iter().any(|a| a == artifact))
    }

    pub fn last_phase_id(&self) -> Option<&str> {
        self.phase_history.last().map(|p| p.phase_id.as_str())
    }

    pub fn summary(&self) -> WorkflowRunSummary {
        WorkflowRunSummary {
            id: self.id.clone(),
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            task: self.input.task.clone(),
            live: self.live,
            started_at_ms: self.started_at_ms,
            finished_at_ms: self.finished_at_ms,
            duration_ms: self.finished_at_ms.map(|end| end - self.started_at_ms),
            phase_count: self.phase_history.len(),
            failed_phase_count: self
                .phase_history
                .iter()
                .filter(|p| p.status != PhaseStatus::Completed)
                .count(),
            approval_count: self.approval_count,
            agent_run_count: self.agent_run_count,
            review_iterations: self.review_iterations,
            review_iterations_exhausted: self.review_iterations_exhausted,
            error: self.error.clone(),
        }
    }
}

/// The `run.json` view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunSummary {
    pub id: String,
    pub workflow_type: String,
    pub status: RunStatus,
    pub task: String,
    pub live: bool,
    pub started_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub phase_count: usize,
    pub failed_phase_count: usize,
    pub approval_count: u32,
    pub agent_run_count: u32,
    #[serde(default)]
    pub review_iterations: u32,
    #[serde(default)]
    pub review_iterations_exhausted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

//! Collaborator interfaces consumed by the orchestrator, and their local
//! implementations.
//!
//! - [`agent`]: spawns an agent command per phase attempt
//! - [`run_store`]: file-backed persistence and artifact storage
//! - [`workspace`]: in-place / worktree / copy workspaces

pub mod agent;
pub mod run_store;
pub mod workspace;

pub use agent::CommandAgentRunner;
pub use run_store::FsRunStore;
pub use workspace::LocalWorkspaceManager;

use crate::handoff::HandoffPackage;
use crate::policy::ExecOverrides;
use crate::tracker::ChangeSet;
use crate::workflow::{EngineRole, WorkflowEvent, WorkflowRun, WorkflowRunSummary, WorkspaceConfig};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub session_id: String,
    pub phase_id: String,
    pub engine: EngineRole,
    pub iteration: u32,
    pub prompt: String,
    pub workspace_path: PathBuf,
    /// Where the agent may write its output artifacts directly.
    pub artifacts_dir: Option<PathBuf>,
    pub timeout_ms: u64,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub exec: ExecOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub output_chars: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentResponse {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Artifacts returned inline, by name. Saved by the orchestrator.
    pub artifacts: BTreeMap<String, String>,
    pub metrics: AgentMetrics,
}

impl AgentResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_artifact(mut self, name: &str, content: impl Into<String>) -> Self {
        self.artifacts.insert(name.to_string(), content.into());
        self
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run the agent. Must return promptly once `cancel` fires.
    async fn run(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentResponse>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save_artifact(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
        name: &str,
        content: &str,
    ) -> Result<()>;

    async fn load_artifact(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
        name: &str,
    ) -> Result<Option<String>>;

    async fn save_handoff(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
        package: &HandoffPackage,
    ) -> Result<()>;

    async fn load_handoff(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
    ) -> Result<Option<HandoffPackage>>;

    /// A directory the agent can write artifacts into, if the store has one.
    fn artifacts_dir(&self, _run_id: &str, _phase_id: &str, _iteration: u32) -> Option<PathBuf> {
        None
    }
}

#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    async fn setup_workspace(&self, run_id: &str, config: &WorkspaceConfig) -> Result<PathBuf>;

    async fn cleanup_workspace(
        &self,
        run_id: &str,
        config: &WorkspaceConfig,
        workspace: &Path,
    ) -> Result<()>;

    async fn changed_files(&self, workspace: &Path) -> Result<ChangeSet>;

    async fn diff_summary(&self, workspace: &Path) -> Result<Vec<String>>;
}

#[async_trait]
pub trait WorkflowPersistence: Send + Sync {
    async fn save_workflow_state(&self, run: &WorkflowRun) -> Result<()>;

    async fn load_workflow_state(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    async fn log_workflow_event(&self, event: &WorkflowEvent) -> Result<()>;

    async fn list_runs(&self) -> Result<Vec<WorkflowRunSummary>>;
}

//! File-backed run storage.
//!
//! ```text
//! <root>/<run-id>/
//!   run.json                         summary
//!   state.json                       full run, for reloading
//!   events.jsonl                     append-only event stream
//!   approvals.jsonl                  written by the file approval store
//!   phases/<NN>-<phase>/artifacts/*
//!   phases/<NN>-<phase>/handoff/{context.json,instructions.md,expectations.json}
//! ```

use crate::handoff::HandoffPackage;
use crate::runtime::{ArtifactStore, WorkflowPersistence};
use crate::workflow::{WorkflowEvent, WorkflowRun, WorkflowRunSummary};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const RUN_FILE: &str = "run.json";
pub const STATE_FILE: &str = "state.json";
pub const EVENTS_FILE: &str = "events.jsonl";

/// A non-empty relative path made only of normal components: no `..`,
/// no root, no prefix.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[derive(Debug, Clone)]
pub struct FsRunStore {
    root: PathBuf,
}

impl FsRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<run-id>`. The id must be a single plain path segment.
    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        if !is_plain_name(run_id) || Path::new(run_id).components().count() != 1 {
            bail!("Invalid run id '{}'", run_id);
        }
        Ok(self.root.join(run_id))
    }

    pub fn phase_dir(&self, run_id: &str, phase_id: &str, iteration: u32) -> Result<PathBuf> {
        Ok(self
            .run_dir(run_id)?
            .join("phases")
            .join(format!("{:02}-{}", iteration, phase_id)))
    }

    fn artifact_path(&self, run_id: &str, phase_id: &str, iteration: u32, name: &str) -> Result<PathBuf> {
        if !is_plain_name(name) {
            bail!("Invalid artifact name '{}'", name);
        }
        Ok(self
            .phase_dir(run_id, phase_id, iteration)?
            .join("artifacts")
            .join(name))
    }

    fn handoff_dir(&self, run_id: &str, phase_id: &str, iteration: u32) -> Result<PathBuf> {
        Ok(self.phase_dir(run_id, phase_id, iteration)?.join("handoff"))
    }

    async fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub async fn load_summary(&self, run_id: &str) -> Result<Option<WorkflowRunSummary>> {
        let path = self.run_dir(run_id)?.join(RUN_FILE);
        match Self::read_optional(&path).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("Malformed run summary {}", path.display()))?,
            )),
            None => Ok(None),
        }
    }

    /// Events in append order. Malformed lines are skipped.
    pub async fn read_events(&self, run_id: &str) -> Result<Vec<WorkflowEvent>> {
        let path = self.run_dir(run_id)?.join(EVENTS_FILE);
        let Some(raw) = Self::read_optional(&path).await? else {
            return Ok(Vec::new());
        };
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed event line");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl WorkflowPersistence for FsRunStore {
    async fn save_workflow_state(&self, run: &WorkflowRun) -> Result<()> {
        let dir = self.run_dir(&run.id)?;
        Self::write_json(&dir.join(STATE_FILE), run).await?;
        Self::write_json(&dir.join(RUN_FILE), &run.summary()).await
    }

    async fn load_workflow_state(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let path = self.run_dir(run_id)?.join(STATE_FILE);
        match Self::read_optional(&path).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("Malformed run state {}", path.display()))?,
            )),
            None => Ok(None),
        }
    }

    async fn log_workflow_event(&self, event: &WorkflowEvent) -> Result<()> {
        let dir = self.run_dir(&event.run_id)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let path = dir.join(EVENTS_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRunSummary>> {
        let mut summaries = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(summaries),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.root.display()));
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().to_string();
            match self.load_summary(&run_id).await {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(e) => tracing::warn!(run_id, error = %e, "skipping unreadable run"),
            }
        }
        summaries.sort_by(|a, b| b.started_at_ms.cmp(&a.started_at_ms));
        Ok(summaries)
    }
}

#[async_trait]
impl ArtifactStore for FsRunStore {
    async fn save_artifact(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
        name: &str,
        content: &str,
    ) -> Result<()> {
        let path = self.artifact_path(run_id, phase_id, iteration, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write artifact {}", path.display()))
    }

    async fn load_artifact(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
        name: &str,
    ) -> Result<Option<String>> {
        let path = self.artifact_path(run_id, phase_id, iteration, name)?;
        Self::read_optional(&path).await
    }

    async fn save_handoff(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
        package: &HandoffPackage,
    ) -> Result<()> {
        let dir = self.handoff_dir(run_id, phase_id, iteration)?;
        let package = package.clone();
        tokio::task::spawn_blocking(move || package.write_to(&dir))
            .await
            .context("Handoff writer panicked")??;
        Ok(())
    }

    async fn load_handoff(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
    ) -> Result<Option<HandoffPackage>> {
        let dir = self.handoff_dir(run_id, phase_id, iteration)?;
        if fs::metadata(&dir).await.is_err() {
            return Ok(None);
        }
        let package = tokio::task::spawn_blocking(move || HandoffPackage::read_from(&dir))
            .await
            .context("Handoff reader panicked")??;
        Ok(Some(package))
    }

    fn artifacts_dir(&self, run_id: &str, phase_id: &str, iteration: u32) -> Option<PathBuf> {
        self.phase_dir(run_id, phase_id, iteration)
            .ok()
            .map(|dir| dir.join("artifacts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{HandoffBuilder, HandoffRequest};
    use crate::policy::WorkflowPolicy;
    use crate::tracker::ChangeSet;
    use crate::workflow::{
        EngineRole, RunStatus, WorkflowEventType, WorkflowInput, WorkspaceConfig,
    };
    use tempfile::tempdir;

    fn sample_run(now: i64) -> WorkflowRun {
        WorkflowRun::new(
            "plan-execute-review",
            WorkflowInput::new("task", "/repo"),
            WorkspaceConfig::in_place("/repo"),
            false,
            WorkflowPolicy::default(),
            now,
        )
    }

    #[tokio::test]
    async fn test_state_round_trip_and_summary() {
        let dir = tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        let mut run = sample_run(100);
        run.transition(RunStatus::Running, 150).unwrap();
        store.save_workflow_state(&run).await.unwrap();

        let loaded = store.load_workflow_state(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        let summary = store.load_summary(&run.id).await.unwrap().unwrap();
        assert_eq!(summary.status, RunStatus::Running);
        assert!(store.load_workflow_state("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let dir = tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        let older = sample_run(1);
        let newer = sample_run(2);
        store.save_workflow_state(&older).await.unwrap();
        store.save_workflow_state(&newer).await.unwrap();
        std::fs::create_dir_all(dir.path().join("stray")).unwrap();

        let runs = store.list_runs().await.unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);
    }

    #[tokio::test]
    async fn test_list_runs_missing_root() {
        let dir = tempdir().unwrap();
        let store = FsRunStore::new(dir.path().join("absent"));
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_append_in_order() {
        let dir = tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        for (i, ty) in [WorkflowEventType::WorkflowStart, WorkflowEventType::PhaseStart]
            .into_iter()
            .enumerate()
        {
            store
                .log_workflow_event(&WorkflowEvent::new("run-1", ty, i as i64))
                .await
                .unwrap();
        }
        let events = store.read_events("run-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, WorkflowEventType::PhaseStart);
    }

    #[tokio::test]
    async fn test_artifacts_under_iteration_dir() {
        let dir = tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        store
            .save_artifact("run-1", "review", 2, "review.json", "{\"approved\":true}")
            .await
            .unwrap();
        assert!(
            dir.path()
                .join("run-1/phases/02-review/artifacts/review.json")
                .exists()
        );
        let loaded = store.load_artifact("run-1", "review", 2, "review.json").await.unwrap();
        assert_eq!(loaded.as_deref(), Some("{\"approved\":true}"));
        assert!(store.load_artifact("run-1", "review", 1, "review.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_artifact_names_cannot_escape() {
        let dir = tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        for name in ["../escape.json", "/etc/passwd", ""] {
            assert!(store.save_artifact("run-1", "plan", 1, name, "x").await.is_err());
        }
    }

    #[tokio::test]
    async fn test_run_ids_cannot_escape_root() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("runs");
        std::fs::create_dir_all(parent.path().join("outside")).unwrap();
        std::fs::write(parent.path().join("outside/state.json"), "{}").unwrap();
        let store = FsRunStore::new(&root);

        for run_id in ["../outside", "/etc", "", "a/b", "."] {
            assert!(store.run_dir(run_id).is_err(), "{run_id} accepted");
            assert!(store.load_workflow_state(run_id).await.is_err());
            assert!(store.read_events(run_id).await.is_err());
        }
        assert!(store.artifacts_dir("../outside", "plan", 1).is_none());
        assert_eq!(store.run_dir("run-1").unwrap(), root.join("run-1"));
    }

    #[tokio::test]
    async fn test_handoff_round_trip() {
        let dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        let package = HandoffBuilder::new().build(HandoffRequest {
            workflow_id: "run-1".into(),
            phase_id: "plan".into(),
            engine: EngineRole::Planner,
            iteration: 1,
            previous_phase: None,
            task: "task".into(),
            workspace: workspace.path().to_path_buf(),
            input_artifacts: vec![],
            output_artifacts: vec!["plan.json".into()],
            timeout_ms: 1_000,
            changes: Ok(ChangeSet::default()),
            diff_summary: vec![],
        });
        store.save_handoff("run-1", "plan", 1, &package).await.unwrap();
        assert!(dir.path().join("run-1/phases/01-plan/handoff/instructions.md").exists());
        let loaded = store.load_handoff("run-1", "plan", 1).await.unwrap().unwrap();
        assert_eq!(loaded, package);
        assert!(store.load_handoff("run-1", "plan", 2).await.unwrap().is_none());
    }
}

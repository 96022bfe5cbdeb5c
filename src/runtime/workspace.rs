use crate::runtime::WorkspaceManager;
use crate::tracker::{ChangeSet, GitTracker};
use crate::workflow::{WorkspaceConfig, WorkspaceMode};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use walkdir::WalkDir;

/// Prepares workspaces next to the run's storage directory.
#[derive(Debug, Clone)]
pub struct LocalWorkspaceManager {
    runs_root: PathBuf,
}

impl LocalWorkspaceManager {
    pub fn new(runs_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
        }
    }

    pub fn workspace_dir(&self, run_id: &str) -> PathBuf {
        self.runs_root.join(run_id).join("workspace")
    }

    fn branch_name(run_id: &str) -> String {
        let short: String = run_id.chars().take(8).collect();
        format!("conductor/run-{}", short)
    }

    async fn add_worktree(&self, run_id: &str, repo: &Path) -> Result<PathBuf> {
        let path = self.workspace_dir(run_id);
        let parent = path
            .parent()
            .context("Worktree path has no parent directory")?;
        tokio::fs::create_dir_all(parent).await?;

        let branch = Self::branch_name(run_id);
        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch])
            .arg(&path)
            .arg("HEAD")
            .current_dir(repo)
            .output()
            .await
            .context("Failed to create git worktree")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Git worktree creation failed: {}", stderr.trim());
        }
        tracing::info!(run_id, branch = %branch, path = %path.display(), "worktree created");
        Ok(path)
    }

    async fn remove_worktree(&self, repo: &Path, workspace: &Path) -> Result<()> {
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(workspace)
            .current_dir(repo)
            .output()
            .await
            .context("Failed to run git worktree remove")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree remove failed: {}", stderr.trim());
        }
        Ok(())
    }
}

/// Copy `src` into `dst`, skipping any `.git` directory. `dst` may live
/// inside `src`; it is never walked.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    std::fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    // Compare resolved paths so a destination under the source is skipped
    // even when one side is reached through a symlink.
    let src = src
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", src.display()))?;
    let dst = dst
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dst.display()))?;

    let mut copied = 0;
    let walker = WalkDir::new(&src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git" && !e.path().starts_with(&dst));
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let relative = entry.path().strip_prefix(&src)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[async_trait]
impl WorkspaceManager for LocalWorkspaceManager {
    async fn setup_workspace(&self, run_id: &str, config: &WorkspaceConfig) -> Result<PathBuf> {
        let repo = tokio::fs::canonicalize(&config.repo_path)
            .await
            .with_context(|| format!("Repository path {} not found", config.repo_path.display()))?;
        match config.mode {
            WorkspaceMode::InPlace => Ok(repo),
            WorkspaceMode::Worktree => self.add_worktree(run_id, &repo).await,
            WorkspaceMode::Copy => {
                let dst = self.workspace_dir(run_id);
                let target = dst.clone();
                let copied = tokio::task::spawn_blocking(move || copy_tree(&repo, &target))
                    .await
                    .context("Workspace copy panicked")??;
                tracing::info!(run_id, files = copied, path = %dst.display(), "workspace copied");
                Ok(dst)
            }
        }
    }

    async fn cleanup_workspace(
        &self,
        run_id: &str,
        config: &WorkspaceConfig,
        workspace: &Path,
    ) -> Result<()> {
        match config.mode {
            WorkspaceMode::InPlace => Ok(()),
            WorkspaceMode::Worktree => {
                let repo = tokio::fs::canonicalize(&config.repo_path).await?;
                self.remove_worktree(&repo, workspace).await?;
                tracing::info!(run_id, "worktree removed");
                Ok(())
            }
            WorkspaceMode::Copy => {
                if tokio::fs::metadata(workspace).await.is_ok() {
                    tokio::fs::remove_dir_all(workspace)
                        .await
                        .with_context(|| format!("Failed to remove {}", workspace.display()))?;
                }
                Ok(())
            }
        }
    }

    async fn changed_files(&self, workspace: &Path) -> Result<ChangeSet> {
        let workspace = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || GitTracker::new(&workspace)?.changes())
            .await
            .context("Status query panicked")?
    }

    async fn diff_summary(&self, workspace: &Path) -> Result<Vec<String>> {
        let workspace = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || GitTracker::new(&workspace)?.diff_summary())
            .await
            .context("Diff query panicked")?
    }
}

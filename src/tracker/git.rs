use crate::tracker::ChangeSet;
use anyhow::{Context, Result};
use git2::{Delta, Diff, DiffOptions, Repository};
use std::path::Path;

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(workspace: &Path) -> Result<Self> {
        let repo = Repository::discover(workspace).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// HEAD (or the empty tree on an unborn branch) against index + workdir.
    fn working_diff(&self) -> Result<Diff<'_>> {
        let head_tree = match self.head_commit() {
            Some(commit) => Some(commit.tree()?),
            None => None,
        };
        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;
        Ok(diff)
    }

    /// Uncommitted changes, untracked files counted as added.
    pub fn changes(&self) -> Result<ChangeSet> {
        let diff = self.working_diff()?;
        let mut changes = ChangeSet::default();
        for delta in diff.deltas() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().replace('\\', "/"));
            let Some(path) = path else {
                continue;
            };
            match delta.status() {
                Delta::Added | Delta::Untracked => changes.added.push(path),
                Delta::Modified | Delta::Renamed | Delta::Typechange => {
                    changes.modified.push(path)
                }
                Delta::Deleted => changes.deleted.push(path),
                _ => {}
            }
        }
        changes.added.sort();
        changes.modified.sort();
        changes.deleted.sort();
        Ok(changes)
    }

    /// One line per changed file: `<status> <path> (+added -removed)`.
    pub fn diff_summary(&self) -> Result<Vec<String>> {
        let diff = self.working_diff()?;
        let mut lines = Vec::new();

        for delta_idx in 0..diff.deltas().len() {
            let Some(delta) = diff.get_delta(delta_idx) else {
                continue;
            };
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let status = match delta.status() {
                Delta::Added | Delta::Untracked => 'A',
                Delta::Modified | Delta::Typechange => 'M',
                Delta::Deleted => 'D',
                Delta::Renamed => 'R',
                _ => continue,
            };

            let mut added = 0usize;
            let mut removed = 0usize;
            if let Ok(Some(patch)) = git2::Patch::from_diff(&diff, delta_idx)
                && let Ok((_, adds, dels)) = patch.line_stats()
            {
                added = adds;
                removed = dels;
            }
            lines.push(format!(
                "{} {} (+{} -{})",
                status,
                path.display(),
                added,
                removed
            ));
        }

        Ok(lines)
    }
}

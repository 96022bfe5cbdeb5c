//! Builds the handoff package a phase leaves for its agent:
//! `context.json`, `instructions.md` (a per-role template) and
//! `expectations.json`.

use crate::errors::HandoffError;
use crate::handoff::project::{ProjectContext, detect_project, existing_entry_points};
use crate::tracker::ChangeSet;
use crate::workflow::EngineRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONTEXT_FILE: &str = "context.json";
pub const INSTRUCTIONS_FILE: &str = "instructions.md";
pub const EXPECTATIONS_FILE: &str = "expectations.json";

/// Changed files shown in the instructions before truncating.
pub const CHANGED_FILES_PREVIEW: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffContext {
    pub workflow_id: String,
    pub phase: String,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_phase: Option<String>,
    pub task: String,
    pub project_context: ProjectContext,
    #[serde(default)]
    pub relevant_files: Vec<String>,
    #[serde(default)]
    pub changes_in_scope: ChangeSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff_summary: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffExpectations {
    pub engine: EngineRole,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub acceptance: Vec<String>,
}

/// The three-file package handed to the next phase's agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffPackage {
    pub context: HandoffContext,
    pub instructions: String,
    pub expectations: HandoffExpectations,
}

impl HandoffPackage {
    /// The prompt sent to the agent.
    pub fn prompt(&self) -> String {
        format!(
            "{}\n## EXPECTED OUTPUTS\n{}\n",
            self.instructions,
            bullet_list(&self.expectations.output_artifacts, "(none)")
        )
    }

    pub fn write_to(&self, dir: &Path) -> Result<(), HandoffError> {
        fs::create_dir_all(dir).map_err(|source| HandoffError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
        write_file(
            &dir.join(CONTEXT_FILE),
            &serde_json::to_string_pretty(&self.context)?,
        )?;
        write_file(&dir.join(INSTRUCTIONS_FILE), &self.instructions)?;
        write_file(
            &dir.join(EXPECTATIONS_FILE),
            &serde_json::to_string_pretty(&self.expectations)?,
        )?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> Result<Self, HandoffError> {
        let context = serde_json::from_str(&read_file(&dir.join(CONTEXT_FILE))?)?;
        let instructions = read_file(&dir.join(INSTRUCTIONS_FILE))?;
        let expectations = serde_json::from_str(&read_file(&dir.join(EXPECTATIONS_FILE))?)?;
        Ok(Self {
            context,
            instructions,
            expectations,
        })
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), HandoffError> {
    fs::write(path, contents).map_err(|source| HandoffError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn read_file(path: &Path) -> Result<String, HandoffError> {
    fs::read_to_string(path).map_err(|source| HandoffError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!("- {}\n", empty);
    }
    items.iter().map(|item| format!("- {}\n", item)).collect()
}

/// What the builder needs to know about the phase being entered.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub workflow_id: String,
    pub phase_id: String,
    pub engine: EngineRole,
    pub iteration: u32,
    pub previous_phase: Option<String>,
    pub task: String,
    pub workspace: PathBuf,
    pub input_artifacts: Vec<String>,
    pub output_artifacts: Vec<String>,
    pub timeout_ms: u64,
    /// Working-tree status; an error is treated as "no changes".
    pub changes: Result<ChangeSet, String>,
    pub diff_summary: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HandoffBuilder;

impl HandoffBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, request: HandoffRequest) -> HandoffPackage {
        let project_context = detect_project(&request.workspace);
        let changes = match request.changes {
            Ok(changes) => changes,
            Err(e) => {
                tracing::debug!(workspace = %request.workspace.display(), error = %e, "working-tree status unavailable, assuming no changes");
                ChangeSet::default()
            }
        };

        let mut relevant: BTreeSet<String> = changes.all_paths().cloned().collect();
        relevant.extend(existing_entry_points(
            &request.workspace,
            &project_context.language,
        ));

        let context = HandoffContext {
            workflow_id: request.workflow_id,
            phase: request.phase_id,
            iteration: request.iteration,
            previous_phase: request.previous_phase,
            task: request.task,
            project_context,
            relevant_files: relevant.into_iter().collect(),
            changes_in_scope: changes,
            diff_summary: request.diff_summary,
        };
        let instructions = render_instructions(request.engine, &context, &request.input_artifacts);
        let expectations = HandoffExpectations {
            engine: request.engine,
            input_artifacts: request.input_artifacts,
            acceptance: acceptance_for(request.engine, &request.output_artifacts),
            output_artifacts: request.output_artifacts,
            timeout_ms: request.timeout_ms,
        };

        HandoffPackage {
            context,
            instructions,
            expectations,
        }
    }
}

fn acceptance_for(engine: EngineRole, outputs: &[String]) -> Vec<String> {
    let mut acceptance: Vec<String> = outputs
        .iter()
        .map(|name| format!("{} exists in $CONDUCTOR_ARTIFACTS_DIR", name))
        .collect();
    match engine {
        EngineRole::Planner => {
            acceptance.push("the plan has a top-level `tasks` array".to_string())
        }
        EngineRole::Executor => {
            acceptance.push("every planned task is implemented or explicitly deferred".to_string())
        }
        EngineRole::Reviewer => acceptance.push(
            "the review has a boolean `approved` and an `issues` array with `severity` per issue"
                .to_string(),
        ),
    }
    acceptance
}

fn changed_files_preview(changes: &ChangeSet) -> String {
    let mut lines: Vec<String> = Vec::new();
    let labelled = changes
        .added
        .iter()
        .map(|p| ("added", p))
        .chain(changes.modified.iter().map(|p| ("modified", p)))
        .chain(changes.deleted.iter().map(|p| ("deleted", p)));
    for (kind, path) in labelled.take(CHANGED_FILES_PREVIEW) {
        lines.push(format!("- {} ({})", path, kind));
    }
    if lines.is_empty() {
        return "- (no uncommitted changes)\n".to_string();
    }
    let total = changes.len();
    if total > CHANGED_FILES_PREVIEW {
        lines.push(format!("- ... and {} more", total - CHANGED_FILES_PREVIEW));
    }
    lines.join("\n") + "\n"
}

fn render_instructions(engine: EngineRole, ctx: &HandoffContext, inputs: &[String]) -> String {
    let project = &ctx.project_context;
    let framework = project
        .framework
        .as_deref()
        .map(|f| format!(" ({})", f))
        .unwrap_or_default();
    let header = format!(
        "# {} phase `{}` (iteration {})\n\nProject: {} [{}{}]\n\n## TASK\n{}\n\n",
        capitalize(engine.as_str()),
        ctx.phase,
        ctx.iteration,
        project.name,
        project.language,
        framework,
        ctx.task
    );

    let role = match engine {
        EngineRole::Planner => r#"## ROLE
Break the task into small, independently verifiable steps. Do not modify files.
Write the plan as JSON with a `summary` string and a `tasks` array; each task has
an `id`, a `description` and the `files` it expects to touch.
"#
        .to_string(),
        EngineRole::Executor => format!(
            r#"## ROLE
Implement the plan. The inputs below are available in $CONDUCTOR_ARTIFACTS_DIR.
Run the project's checks before finishing. Record what you changed as JSON with a
`summary` string and a `files_changed` array.

## INPUTS
{}"#,
            bullet_list(inputs, "(none)")
        ),
        EngineRole::Reviewer => format!(
            r#"## ROLE
Review the changes against the task. Report JSON with `approved` (boolean), a
`summary` string and an `issues` array; each issue has `severity`
(critical|major|minor), `file` and `message`. Approve only when no critical issue remains.

## INPUTS
{}"#,
            bullet_list(inputs, "(none)")
        ),
    };

    let mut out = header + &role;
    out.push_str("\n## CHANGED FILES\n");
    out.push_str(&changed_files_preview(&ctx.changes_in_scope));
    if let Some(previous) = &ctx.previous_phase {
        out.push_str(&format!("\nPrevious phase: `{}`\n", previous));
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

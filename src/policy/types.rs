//! Policy data model: action types, contexts, rules, scopes and decisions.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The kind of sensitive action an agent phase wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FileRead,
    FileWrite,
    FileDelete,
    BashExecute,
    NetworkRequest,
    GitCommit,
    GitPush,
}

impl ActionType {
    pub fn all() -> &'static [ActionType] {
        &[
            ActionType::FileRead,
            ActionType::FileWrite,
            ActionType::FileDelete,
            ActionType::BashExecute,
            ActionType::NetworkRequest,
            ActionType::GitCommit,
            ActionType::GitPush,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::FileRead => "file_read",
            ActionType::FileWrite => "file_write",
            ActionType::FileDelete => "file_delete",
            ActionType::BashExecute => "bash_execute",
            ActionType::NetworkRequest => "network_request",
            ActionType::GitCommit => "git_commit",
            ActionType::GitPush => "git_push",
        }
    }

    /// Actions that touch the filesystem and are subject to the path guard.
    pub fn is_file_action(&self) -> bool {
        matches!(
            self,
            ActionType::FileRead | ActionType::FileWrite | ActionType::FileDelete
        )
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::all()
            .iter()
            .copied()
            .find(|a| a.as_str() == s.to_lowercase())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid action type '{}'. Valid values: file_read, file_write, file_delete, bash_execute, network_request, git_commit, git_push",
                    s
                )
            })
    }
}

/// A proposed action, as presented to the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
}

impl PolicyContext {
    /// A context with no target, used when projecting the policy's general stance.
    pub fn action(action_type: ActionType) -> Self {
        Self {
            action_type,
            target_path: None,
            command: None,
            url: None,
            workspace_path: None,
        }
    }

    pub fn file(action_type: ActionType, path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: Some(path.into()),
            ..Self::action(action_type)
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::action(ActionType::BashExecute)
        }
    }

    pub fn network(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::action(ActionType::NetworkRequest)
        }
    }

    pub fn in_workspace(mut self, workspace: &Path) -> Self {
        self.workspace_path = Some(workspace.to_path_buf());
        self
    }

    /// Short human-readable description of the target.
    pub fn describe_target(&self) -> String {
        if let Some(path) = &self.target_path {
            path.display().to_string()
        } else if let Some(command) = &self.command {
            command.clone()
        } else if let Some(url) = &self.url {
            url.clone()
        } else {
            "*".to_string()
        }
    }
}

/// The decision a rule (or the default) declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    #[default]
    Allow,
    Deny,
    Prompt,
}

impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyDecision::Allow => write!(f, "allow"),
            PolicyDecision::Deny => write!(f, "deny"),
            PolicyDecision::Prompt => write!(f, "prompt"),
        }
    }
}

/// The evaluated outcome, with the auditable reason attached to the
/// non-allow arms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
    Prompt(String),
}

impl Decision {
    pub fn kind(&self) -> PolicyDecision {
        match self {
            Decision::Allow => PolicyDecision::Allow,
            Decision::Deny(_) => PolicyDecision::Deny,
            Decision::Prompt(_) => PolicyDecision::Prompt,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Decision::Deny(_))
    }
}

fn default_true() -> bool {
    true
}

/// One ordered policy rule. Rules are never mutated during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub actions: Vec<ActionType>,
    pub decision: PolicyDecision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PolicyRule {
    pub fn new(id: &str, actions: Vec<ActionType>, decision: PolicyDecision) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            actions,
            decision,
            path_patterns: Vec::new(),
            command_patterns: Vec::new(),
            url_patterns: Vec::new(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_paths(mut self, patterns: &[&str]) -> Self {
        self.path_patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_commands(mut self, patterns: &[&str]) -> Self {
        self.command_patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_urls(mut self, patterns: &[&str]) -> Self {
        self.url_patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Which filesystem roots file actions may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    /// Only the run's workspace directory
    #[default]
    WorkspaceOnly,
    /// Only the system temp directory
    TempOnly,
    /// Only the configured `allowed_paths`
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathScope {
    #[serde(default)]
    pub mode: ScopeMode,
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub denied_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkScope {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub allowed_urls: Vec<String>,
    #[serde(default)]
    pub denied_domains: Vec<String>,
}

fn default_destructive_actions() -> Vec<ActionType> {
    vec![ActionType::FileDelete, ActionType::GitPush]
}

/// The full policy bound to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPolicy {
    #[serde(default)]
    pub path_scope: PathScope,
    #[serde(default)]
    pub network_scope: NetworkScope,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub default_decision: PolicyDecision,
    #[serde(default = "default_true")]
    pub require_approval_for_destructive: bool,
    #[serde(default = "default_destructive_actions")]
    pub destructive_actions: Vec<ActionType>,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self {
            path_scope: PathScope::default(),
            network_scope: NetworkScope::default(),
            rules: Vec::new(),
            default_decision: PolicyDecision::Allow,
            require_approval_for_destructive: true,
            destructive_actions: default_destructive_actions(),
        }
    }
}

/// The result of evaluating one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyResult {
    pub action: ActionType,
    pub decision: Decision,
    /// The winning rule, if any rule matched
    pub rule_id: Option<String>,
    /// Whether the destructive-action override downgraded an allow
    pub destructive_override: bool,
}

impl PolicyResult {
    pub fn reason(&self) -> String {
        match &self.decision {
            Decision::Allow => match &self.rule_id {
                Some(id) => format!("rule '{}' allows {}", id, self.action),
                None => format!("default decision allows {}", self.action),
            },
            Decision::Deny(reason) | Decision::Prompt(reason) => reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_parses_snake_case() {
        assert_eq!(
            "bash_execute".parse::<ActionType>().unwrap(),
            ActionType::BashExecute
        );
        assert_eq!(
            "GIT_PUSH".parse::<ActionType>().unwrap(),
            ActionType::GitPush
        );
        assert!("rm".parse::<ActionType>().is_err());
    }

    #[test]
    fn policy_deserializes_from_toml_with_defaults() {
        let policy: WorkflowPolicy = toml::from_str(
            r#"
default_decision = "prompt"

[[rules]]
id = "no-push"
actions = ["git_push"]
decision = "deny"
priority = 10
"#,
        )
        .unwrap();
        assert_eq!(policy.default_decision, PolicyDecision::Prompt);
        assert!(policy.require_approval_for_destructive);
        assert_eq!(policy.rules.len(), 1);
        assert!(policy.rules[0].enabled);
        assert_eq!(policy.path_scope.mode, ScopeMode::WorkspaceOnly);
        assert!(policy.destructive_actions.contains(&ActionType::FileDelete));
    }

    #[test]
    fn context_describes_its_target() {
        assert_eq!(PolicyContext::command("ls -la").describe_target(), "ls -la");
        assert_eq!(
            PolicyContext::action(ActionType::GitCommit).describe_target(),
            "*"
        );
    }
}

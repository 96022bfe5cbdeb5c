//! Configuration loaded from `.conductor/conductor.toml`.
//!
//! Layering is file → environment → CLI. A missing project file falls back
//! to the user-level `~/.config/conductor/conductor.toml`, then to defaults.
//!
//! ```toml
//! [orchestrator]
//! live = false
//! run_root = ".conductor/runs"
//! approval_timeout_ms = 300000
//! auto_approve = false
//!
//! [agent]
//! command = "claude"
//! args = ["--print"]
//! model = "sonnet"
//! timeout_ms = 600000
//!
//! [rate_limit]
//! window_ms = 60000
//! max_per_window = 10
//! audit_capacity = 200
//!
//! [policy]
//! default_decision = "allow"
//!
//! [[workflows]]
//! type = "plan-only"
//! [[workflows.phases]]
//! id = "plan"
//! engine = "planner"
//! output_artifacts = ["plan.json"]
//! ```

use crate::approval::{DEFAULT_AUDIT_CAPACITY, ExecApprovalManager, RateLimitConfig};
use crate::clock::Clock;
use crate::policy::WorkflowPolicy;
use crate::workflow::{DefinitionRegistry, WorkflowDefinition};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CONFIG_DIR: &str = ".conductor";
pub const CONFIG_FILE: &str = "conductor.toml";

pub const ENV_LIVE: &str = "CONDUCTOR_LIVE";
pub const ENV_RUN_ROOT: &str = "CONDUCTOR_RUN_ROOT";
pub const ENV_AGENT_CMD: &str = "CONDUCTOR_AGENT_CMD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Invoke the agent runner instead of stub output
    #[serde(default)]
    pub live: bool,
    /// Run storage root, relative to the project directory if not absolute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_root: Option<PathBuf>,
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
    /// Approve every prompt without asking
    #[serde(default)]
    pub auto_approve: bool,
}

fn default_approval_timeout_ms() -> u64 {
    300_000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            live: false,
            run_root: None,
            approval_timeout_ms: default_approval_timeout_ms(),
            auto_approve: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Overrides every phase's own timeout when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
            model: None,
            provider: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

fn default_window_ms() -> u64 {
    RateLimitConfig::default().window_ms
}

fn default_max_per_window() -> u32 {
    RateLimitConfig::default().max_per_window
}

fn default_audit_capacity() -> usize {
    DEFAULT_AUDIT_CAPACITY
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_per_window: default_max_per_window(),
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl RateLimitSection {
    pub fn limits(&self) -> RateLimitConfig {
        RateLimitConfig {
            window_ms: self.window_ms,
            max_per_window: self.max_per_window,
        }
    }
}

/// The on-disk file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub policy: WorkflowPolicy,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

impl ConductorToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Project file, else the user-level file, else defaults.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let project_file = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if project_file.exists() {
            return Self::load(&project_file);
        }
        if let Some(user_file) = user_config_file()
            && user_file.exists()
        {
            tracing::debug!(path = %user_file.display(), "using user-level config");
            return Self::load(&user_file);
        }
        Ok(Self::default())
    }
}

pub fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("conductor").join(CONFIG_FILE))
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub toml: ConductorToml,
}

impl ConductorConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_env(project_dir, |key| std::env::var(key).ok())
    }

    /// Load with an explicit environment lookup.
    pub fn with_env(project_dir: PathBuf, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let mut toml = ConductorToml::load_or_default(&project_dir)?;
        apply_env(&mut toml, env)?;
        Ok(Self { project_dir, toml })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.project_dir.join(CONFIG_DIR)
    }

    pub fn run_root(&self) -> PathBuf {
        match &self.toml.orchestrator.run_root {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.project_dir.join(path),
            None => self.config_dir().join("runs"),
        }
    }

    pub fn live(&self) -> bool {
        self.toml.orchestrator.live
    }

    pub fn policy(&self) -> &WorkflowPolicy {
        &self.toml.policy
    }

    /// A shell-approval manager honouring the `[rate_limit]` section.
    pub fn exec_approvals(&self, clock: Arc<dyn Clock>) -> ExecApprovalManager {
        let section = &self.toml.rate_limit;
        ExecApprovalManager::new(section.limits(), section.audit_capacity, clock)
    }

    /// Built-in definitions plus the configured ones.
    pub fn registry(&self) -> Result<DefinitionRegistry> {
        let mut registry = DefinitionRegistry::with_builtins();
        for definition in &self.toml.workflows {
            registry
                .register(definition.clone())
                .context("Invalid workflow in conductor.toml")?;
        }
        Ok(registry)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{} must be a boolean, got '{}'", key, other),
    }
}

fn apply_env(toml: &mut ConductorToml, env: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(value) = env(ENV_LIVE) {
        toml.orchestrator.live = parse_bool(ENV_LIVE, &value)?;
    }
    if let Some(value) = env(ENV_RUN_ROOT).filter(|v| !v.trim().is_empty()) {
        toml.orchestrator.run_root = Some(PathBuf::from(value));
    }
    if let Some(value) = env(ENV_AGENT_CMD).filter(|v| !v.trim().is_empty()) {
        toml.agent.command = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyDecision;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_empty_gives_defaults() {
        let toml = ConductorToml::parse("").unwrap();
        assert!(!toml.orchestrator.live);
        assert_eq!(toml.orchestrator.approval_timeout_ms, 300_000);
        assert_eq!(toml.agent.command, "claude");
        assert_eq!(toml.rate_limit.max_per_window, 10);
        assert_eq!(toml.rate_limit.window_ms, 60_000);
        assert!(toml.workflows.is_empty());
    }

    #[test]
    fn test_parse_sections() {
        let toml = ConductorToml::parse(
            r#"
[orchestrator]
live = true
auto_approve = true

[agent]
command = "my-agent"
args = ["--json"]
model = "large"

[rate_limit]
max_per_window = 3

[policy]
default_decision = "prompt"

[[policy.rules]]
id = "no-push"
actions = ["git_push"]
decision = "deny"
"#,
        )
        .unwrap();
        assert!(toml.orchestrator.live);
        assert!(toml.orchestrator.auto_approve);
        assert_eq!(toml.agent.args, vec!["--json".to_string()]);
        assert_eq!(toml.agent.model.as_deref(), Some("large"));
        assert_eq!(toml.rate_limit.limits().max_per_window, 3);
        assert_eq!(toml.policy.default_decision, PolicyDecision::Prompt);
        assert_eq!(toml.policy.rules[0].id, "no-push");
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(ConductorToml::parse("[orchestrator\nlive = ").is_err());
    }

    #[test]
    fn test_project_file_and_run_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            "[orchestrator]\nrun_root = \"state/runs\"\n",
        )
        .unwrap();
        let config = ConductorConfig::with_env(dir.path().to_path_buf(), no_env).unwrap();
        assert_eq!(
            config.run_root(),
            dir.path().canonicalize().unwrap().join("state/runs")
        );
    }

    #[test]
    fn test_default_run_root_under_config_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(dir.path().join(CONFIG_DIR).join(CONFIG_FILE), "").unwrap();
        let config = ConductorConfig::with_env(dir.path().to_path_buf(), no_env).unwrap();
        assert!(config.run_root().ends_with(".conductor/runs"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            "[orchestrator]\nlive = false\n[agent]\ncommand = \"from-file\"\n",
        )
        .unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_LIVE, "true"),
            (ENV_AGENT_CMD, "from-env"),
            (ENV_RUN_ROOT, "/var/conductor"),
        ]);
        let config = ConductorConfig::with_env(dir.path().to_path_buf(), |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();
        assert!(config.live());
        assert_eq!(config.toml.agent.command, "from-env");
        assert_eq!(config.run_root(), PathBuf::from("/var/conductor"));
    }

    #[test]
    fn test_exec_approvals_use_rate_limit_section() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            "[rate_limit]\nmax_per_window = 1\naudit_capacity = 4\n",
        )
        .unwrap();
        let config = ConductorConfig::with_env(dir.path().to_path_buf(), no_env).unwrap();
        let clock = Arc::new(crate::clock::ManualClock::new(0));
        let manager = config.exec_approvals(clock);
        let request = crate::approval::ExecRequest {
            command: "ls".to_string(),
            cwd: None,
            host: None,
            security: crate::policy::ExecSecurity::Allowlist,
            ask: crate::policy::ExecAsk::Always,
            agent_id: None,
            session_key: "s1".to_string(),
        };
        assert!(!manager.create(request.clone(), 1_000, None).is_rate_limited());
        assert!(manager.create(request, 1_000, None).is_rate_limited());
    }

    #[test]
    fn test_bad_bool_env_is_error() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(dir.path().join(CONFIG_DIR).join(CONFIG_FILE), "").unwrap();
        let result = ConductorConfig::with_env(dir.path().to_path_buf(), |k| {
            (k == ENV_LIVE).then(|| "maybe".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_includes_configured_workflows() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            r#"
[[workflows]]
type = "plan-only"

[[workflows.phases]]
id = "plan"
engine = "planner"
output_artifacts = ["plan.json"]
"#,
        )
        .unwrap();
        let config = ConductorConfig::with_env(dir.path().to_path_buf(), no_env).unwrap();
        let registry = config.registry().unwrap();
        assert!(registry.contains("plan-only"));
        assert!(registry.contains(crate::workflow::PLAN_EXECUTE_REVIEW));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = ConductorToml::default();
        toml.agent.command = "agent-x".to_string();
        toml.save(&path).unwrap();
        assert_eq!(ConductorToml::load(&path).unwrap().agent.command, "agent-x");
    }
}

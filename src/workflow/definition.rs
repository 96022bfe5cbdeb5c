//! Workflow definitions and the registry that validates them.
//!
//! Definitions are static: once registered they are never mutated. Extra
//! definitions can be declared in `.conductor/conductor.toml`:
//!
//! ```toml
//! [[workflows]]
//! type = "plan-only"
//!
//! [workflows.settings]
//! max_agent_runs = 2
//!
//! [[workflows.phases]]
//! id = "plan"
//! engine = "planner"
//! output_artifacts = ["plan.json"]
//! ```

use crate::errors::OrchestratorError;
use crate::policy::ActionType;
use crate::workflow::condition::Condition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub const PLAN_EXECUTE_REVIEW: &str = "plan-execute-review";

/// The role an agent plays in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineRole {
    Planner,
    Executor,
    Reviewer,
}

impl EngineRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineRole::Planner => "planner",
            EngineRole::Executor => "executor",
            EngineRole::Reviewer => "reviewer",
        }
    }

    /// Actions a phase of this role needs unless it declares its own.
    pub fn default_required_actions(&self) -> Vec<ActionType> {
        match self {
            EngineRole::Planner | EngineRole::Reviewer => vec![ActionType::FileRead],
            EngineRole::Executor => vec![ActionType::FileWrite, ActionType::BashExecute],
        }
    }
}

impl std::fmt::Display for EngineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSettings {
    #[serde(default = "default_phase_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

fn default_phase_timeout_ms() -> u64 {
    600_000
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_phase_timeout_ms(),
            retries: 0,
        }
    }
}

/// Jump back after a successful phase while `condition` holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatTransition {
    pub condition: String,
    /// Phase to resume from; defaults to the phase itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    pub engine: EngineRole,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    #[serde(default)]
    pub settings: PhaseSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_actions: Option<Vec<ActionType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatTransition>,
    /// A failed non-fatal phase is skipped instead of failing the run.
    #[serde(default)]
    pub non_fatal: bool,
}

impl PhaseDefinition {
    pub fn new(id: &str, engine: EngineRole) -> Self {
        Self {
            id: id.to_string(),
            engine,
            input_artifacts: Vec::new(),
            output_artifacts: Vec::new(),
            settings: PhaseSettings::default(),
            required_actions: None,
            repeat: None,
            non_fatal: false,
        }
    }

    pub fn with_inputs(mut self, names: &[&str]) -> Self {
        self.input_artifacts = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, names: &[&str]) -> Self {
        self.output_artifacts = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.settings.retries = retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.settings.timeout_ms = timeout_ms;
        self
    }

    pub fn with_required_actions(mut self, actions: Vec<ActionType>) -> Self {
        self.required_actions = Some(actions);
        self
    }

    pub fn repeat_while(mut self, condition: &str, goto: Option<&str>) -> Self {
        self.repeat = Some(RepeatTransition {
            condition: condition.to_string(),
            goto: goto.map(str::to_string),
        });
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.non_fatal = true;
        self
    }

    pub fn effective_required_actions(&self) -> Vec<ActionType> {
        self.required_actions
            .clone()
            .unwrap_or_else(|| self.engine.default_required_actions())
    }
}

/// Checked against the named phase's latest artifacts when the run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub phase: String,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default = "default_max_review_iterations")]
    pub max_review_iterations: u32,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: u32,
    #[serde(default = "default_max_agent_runs")]
    pub max_agent_runs: u32,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
}

fn default_max_duration_ms() -> u64 {
    3_600_000
}

fn default_max_review_iterations() -> u32 {
    3
}

fn default_max_tasks() -> u32 {
    20
}

fn default_max_agent_runs() -> u32 {
    10
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_duration_ms: default_max_duration_ms(),
            max_review_iterations: default_max_review_iterations(),
            max_tasks: default_max_tasks(),
            max_agent_runs: default_max_agent_runs(),
            success_criteria: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(rename = "type")]
    pub workflow_type: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseDefinition>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowDefinition {
    pub fn new(workflow_type: &str, phases: Vec<PhaseDefinition>) -> Self {
        Self {
            workflow_type: workflow_type.to_string(),
            description: String::new(),
            phases,
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == id)
    }

    fn invalid(&self, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::InvalidDefinition {
            workflow_type: self.workflow_type.clone(),
            message: message.into(),
        }
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.workflow_type.trim().is_empty() {
            return Err(self.invalid("workflow type must not be empty"));
        }
        if self.phases.is_empty() {
            return Err(self.invalid("at least one phase is required"));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.id.as_str()) {
                return Err(self.invalid(format!("duplicate phase id '{}'", phase.id)));
            }
        }

        for (index, phase) in self.phases.iter().enumerate() {
            for input in &phase.input_artifacts {
                let produced_earlier = self.phases[..index]
                    .iter()
                    .any(|p| p.output_artifacts.contains(input));
                if !produced_earlier {
                    return Err(self.invalid(format!(
                        "phase '{}' needs '{}' but no earlier phase produces it",
                        phase.id, input
                    )));
                }
            }
            if let Some(repeat) = &phase.repeat {
                Condition::parse(&repeat.condition).map_err(|e| {
                    self.invalid(format!(
                        "phase '{}' repeat condition '{}': {}",
                        phase.id, repeat.condition, e
                    ))
                })?;
                if let Some(goto) = &repeat.goto {
                    match self.phase_index(goto) {
                        Some(target) if target <= index => {}
                        Some(_) => {
                            return Err(self.invalid(format!(
                                "phase '{}' can only repeat back to itself or an earlier phase, not '{}'",
                                phase.id, goto
                            )));
                        }
                        None => {
                            return Err(self.invalid(format!(
                                "phase '{}' repeats to unknown phase '{}'",
                                phase.id, goto
                            )));
                        }
                    }
                }
            }
        }

        for criterion in &self.settings.success_criteria {
            if self.phase(&criterion.phase).is_none() {
                return Err(self.invalid(format!(
                    "success criterion refers to unknown phase '{}'",
                    criterion.phase
                )));
            }
            Condition::parse(&criterion.condition).map_err(|e| {
                self.invalid(format!(
                    "success criterion '{}': {}",
                    criterion.condition, e
                ))
            })?;
        }
        Ok(())
    }

    /// plan → execute → review, repeating execute/review while the review
    /// is not approved.
    pub fn plan_execute_review() -> Self {
        Self {
            workflow_type: PLAN_EXECUTE_REVIEW.to_string(),
            description: "Plan the change, implement it, review it; rework until approved"
                .to_string(),
            phases: vec![
                PhaseDefinition::new("plan", EngineRole::Planner).with_outputs(&["plan.json"]),
                PhaseDefinition::new("execute", EngineRole::Executor)
                    .with_inputs(&["plan.json"])
                    .with_outputs(&["changes.json"])
                    .with_retries(1),
                PhaseDefinition::new("review", EngineRole::Reviewer)
                    .with_inputs(&["changes.json"])
                    .with_outputs(&["review.json"])
                    .repeat_while("$.approved == false", Some("execute")),
            ],
            settings: WorkflowSettings::default(),
        }
    }
}

/// Registered definitions, keyed by type.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: BTreeMap<String, WorkflowDefinition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtin = WorkflowDefinition::plan_execute_review();
        registry
            .definitions
            .insert(builtin.workflow_type.clone(), builtin);
        registry
    }

    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), OrchestratorError> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.workflow_type) {
            return Err(definition.invalid("a definition with this type is already registered"));
        }
        tracing::debug!(workflow_type = %definition.workflow_type, phases = definition.phases.len(), "registered workflow definition");
        self.definitions
            .insert(definition.workflow_type.clone(), definition);
        Ok(())
    }

    pub fn get(&self, workflow_type: &str) -> Result<&WorkflowDefinition, OrchestratorError> {
        self.definitions
            .get(workflow_type)
            .ok_or_else(|| OrchestratorError::DefinitionNotFound {
                workflow_type: workflow_type.to_string(),
            })
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    pub fn list(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.definitions.values()
    }
}

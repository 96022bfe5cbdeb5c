//! Workflow runs: definitions, the condition language, the event stream
//! and the orchestrator that drives runs to a terminal status.

pub mod condition;
pub mod definition;
pub mod events;
pub mod orchestrator;
pub mod types;

pub use condition::{Condition, ConditionError};
pub use definition::{
    DefinitionRegistry, EngineRole, PLAN_EXECUTE_REVIEW, PhaseDefinition, PhaseSettings,
    RepeatTransition, SuccessCriterion, WorkflowDefinition, WorkflowSettings,
};
pub use events::{WorkflowEvent, WorkflowEventType};
pub use orchestrator::{Collaborators, OrchestratorOptions, WorkflowOrchestrator};
pub use types::{
    PhaseExecution, PhaseStatus, RunStatus, WorkflowInput, WorkflowRun, WorkflowRunSummary,
    WorkspaceConfig, WorkspaceMode,
};

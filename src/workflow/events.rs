//! Structured per-run event stream, appended to `events.jsonl`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowEventType {
    #[serde(rename = "workflow.start")]
    WorkflowStart,
    #[serde(rename = "workflow.complete")]
    WorkflowComplete,
    #[serde(rename = "workflow.fail")]
    WorkflowFail,
    #[serde(rename = "workflow.abort")]
    WorkflowAbort,
    #[serde(rename = "phase.start")]
    PhaseStart,
    #[serde(rename = "phase.complete")]
    PhaseComplete,
    #[serde(rename = "phase.fail")]
    PhaseFail,
    #[serde(rename = "phase.skip")]
    PhaseSkip,
    #[serde(rename = "agent.start")]
    AgentStart,
    #[serde(rename = "agent.progress")]
    AgentProgress,
    #[serde(rename = "agent.complete")]
    AgentComplete,
    #[serde(rename = "agent.fail")]
    AgentFail,
    #[serde(rename = "agent.timeout")]
    AgentTimeout,
    #[serde(rename = "policy.evaluate")]
    PolicyEvaluate,
    #[serde(rename = "policy.allow")]
    PolicyAllow,
    #[serde(rename = "policy.deny")]
    PolicyDeny,
    #[serde(rename = "policy.prompt")]
    PolicyPrompt,
    #[serde(rename = "approval.request")]
    ApprovalRequest,
    #[serde(rename = "approval.approved")]
    ApprovalApproved,
    #[serde(rename = "approval.denied")]
    ApprovalDenied,
    #[serde(rename = "approval.timeout")]
    ApprovalTimeout,
    #[serde(rename = "artifact.save")]
    ArtifactSave,
    #[serde(rename = "artifact.load")]
    ArtifactLoad,
    #[serde(rename = "cleanup.start")]
    CleanupStart,
    #[serde(rename = "cleanup.complete")]
    CleanupComplete,
    #[serde(rename = "cleanup.error")]
    CleanupError,
}

impl WorkflowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEventType::WorkflowStart => "workflow.start",
            WorkflowEventType::WorkflowComplete => "workflow.complete",
            WorkflowEventType::WorkflowFail => "workflow.fail",
            WorkflowEventType::WorkflowAbort => "workflow.abort",
            WorkflowEventType::PhaseStart => "phase.start",
            WorkflowEventType::PhaseComplete => "phase.complete",
            WorkflowEventType::PhaseFail => "phase.fail",
            WorkflowEventType::PhaseSkip => "phase.skip",
            WorkflowEventType::AgentStart => "agent.start",
            WorkflowEventType::AgentProgress => "agent.progress",
            WorkflowEventType::AgentComplete => "agent.complete",
            WorkflowEventType::AgentFail => "agent.fail",
            WorkflowEventType::AgentTimeout => "agent.timeout",
            WorkflowEventType::PolicyEvaluate => "policy.evaluate",
            WorkflowEventType::PolicyAllow => "policy.allow",
            WorkflowEventType::PolicyDeny => "policy.deny",
            WorkflowEventType::PolicyPrompt => "policy.prompt",
            WorkflowEventType::ApprovalRequest => "approval.request",
            WorkflowEventType::ApprovalApproved => "approval.approved",
            WorkflowEventType::ApprovalDenied => "approval.denied",
            WorkflowEventType::ApprovalTimeout => "approval.timeout",
            WorkflowEventType::ArtifactSave => "artifact.save",
            WorkflowEventType::ArtifactLoad => "artifact.load",
            WorkflowEventType::CleanupStart => "cleanup.start",
            WorkflowEventType::CleanupComplete => "cleanup.complete",
            WorkflowEventType::CleanupError => "cleanup.error",
        }
    }
}

impl std::fmt::Display for WorkflowEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: WorkflowEventType,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl WorkflowEvent {
    pub fn new(run_id: &str, event_type: WorkflowEventType, timestamp_ms: i64) -> Self {
        Self {
            run_id: run_id.to_string(),
            event_type,
            timestamp_ms,
            phase_id: None,
            iteration: None,
            data: Value::Null,
        }
    }

    pub fn for_phase(mut self, phase_id: &str, iteration: u32) -> Self {
        self.phase_id = Some(phase_id.to_string());
        self.iteration = Some(iteration);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

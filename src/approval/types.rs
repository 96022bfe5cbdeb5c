//! Approval requests, records and outcomes.

use crate::policy::{PolicyContext, url_origin};
use serde::{Deserialize, Serialize};

/// A pending request for a human decision on one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    pub phase_id: String,
    pub action: PolicyContext,
    pub reason: String,
    pub created_at_ms: i64,
    pub timeout_ms: u64,
}

impl ApprovalRequest {
    pub fn new(
        run_id: &str,
        phase_id: &str,
        action: PolicyContext,
        reason: impl Into<String>,
        created_at_ms: i64,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            action,
            reason: reason.into(),
            created_at_ms,
            timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Denied,
    Timeout,
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalDecision::Approved => write!(f, "approved"),
            ApprovalDecision::Denied => write!(f, "denied"),
            ApprovalDecision::Timeout => write!(f, "timeout"),
        }
    }
}

/// How far a remembered decision reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RememberScope {
    /// Only later requests in the same run
    #[default]
    Run,
    /// Any run served by the same store instance
    Session,
    /// Any run, across restarts. The file backing reloads these from every
    /// run's log.
    Permanent,
}

/// A decided request. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub request: ApprovalRequest,
    pub decision: ApprovalDecision,
    pub decided_at_ms: i64,
    #[serde(default)]
    pub remember: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remember_scope: Option<RememberScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalRecord {
    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn run_id(&self) -> &str {
        &self.request.run_id
    }

    /// Remembered with a scope that reaches past its own run.
    pub fn crosses_runs(&self) -> bool {
        self.remember
            && matches!(
                self.remember_scope.unwrap_or_default(),
                RememberScope::Session | RememberScope::Permanent
            )
    }

    pub fn is_permanent(&self) -> bool {
        self.remember && self.remember_scope == Some(RememberScope::Permanent)
    }

    /// Whether this record may auto-answer `request`.
    pub fn applies_to(&self, request: &ApprovalRequest) -> bool {
        if !self.remember || self.decision == ApprovalDecision::Timeout {
            return false;
        }
        let scope = self.remember_scope.unwrap_or_default();
        if scope == RememberScope::Run && self.request.run_id != request.run_id {
            return false;
        }
        self.request.action.action_type == request.action.action_type
            && same_target(&self.request.action, &request.action)
    }
}

/// The caller-facing outcome of an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    TimedOut,
}

impl From<ApprovalDecision> for ApprovalOutcome {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => ApprovalOutcome::Approved,
            ApprovalDecision::Denied => ApprovalOutcome::Denied,
            ApprovalDecision::Timeout => ApprovalOutcome::TimedOut,
        }
    }
}

fn executable(command: &str) -> Option<&str> {
    command.split_whitespace().next()
}

/// "Same target" heuristic: exact path, same executable, or same URL origin.
pub fn same_target(a: &PolicyContext, b: &PolicyContext) -> bool {
    if let (Some(pa), Some(pb)) = (&a.target_path, &b.target_path)
        && pa == pb
    {
        return true;
    }
    if let (Some(ca), Some(cb)) = (&a.command, &b.command)
        && let (Some(ea), Some(eb)) = (executable(ca), executable(cb))
        && ea == eb
    {
        return true;
    }
    if let (Some(ua), Some(ub)) = (&a.url, &b.url)
        && let (Some(oa), Some(ob)) = (url_origin(ua), url_origin(ub))
        && oa == ob
    {
        return true;
    }
    // Untargeted actions (e.g. a bare git_push) match each other.
    is_untargeted(a) && is_untargeted(b)
}

fn is_untargeted(ctx: &PolicyContext) -> bool {
    ctx.target_path.is_none() && ctx.command.is_none() && ctx.url.is_none()
}

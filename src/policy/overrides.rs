//! Projection of a workflow policy onto the simpler execution-sandbox
//! settings consumed by the external command executor.

use crate::policy::engine::PolicyEngine;
use crate::policy::types::{ActionType, Decision, PolicyContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecSecurity {
    Deny,
    Allowlist,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecAsk {
    Off,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOverrides {
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    pub shell_allowed: bool,
    pub network_allowed: bool,
}

fn security_for(decision: &Decision) -> (ExecSecurity, ExecAsk) {
    match decision {
        Decision::Deny(_) => (ExecSecurity::Deny, ExecAsk::Off),
        Decision::Prompt(_) => (ExecSecurity::Allowlist, ExecAsk::Always),
        Decision::Allow => (ExecSecurity::Full, ExecAsk::Off),
    }
}

/// Derive exec overrides from the policy's untargeted stance on shell and
/// network actions. An allow downgraded by the destructive override already
/// evaluates as a prompt, so it reports as `(allowlist, always)`.
pub fn derive_exec_overrides(engine: &PolicyEngine) -> ExecOverrides {
    let shell = engine.evaluate(&PolicyContext::action(ActionType::BashExecute));
    let network = engine.evaluate(&PolicyContext::action(ActionType::NetworkRequest));
    let (security, ask) = security_for(&shell.decision);
    ExecOverrides {
        security,
        ask,
        shell_allowed: !shell.decision.is_deny(),
        network_allowed: !network.decision.is_deny(),
    }
}

//! Policy engine: converts a proposed action into allow / deny / prompt.
//!
//! - [`types`]: action types, contexts, rules, scopes and decisions
//! - [`engine`]: ordered rule evaluation and the destructive-action override
//! - [`guards`]: hard path and network scope checks
//! - [`overrides`]: projection onto execution-sandbox settings
//!
//! # Configuration
//!
//! Policies are usually declared in the `[policy]` section of
//! `.conductor/conductor.toml`:
//!
//! ```toml
//! [policy]
//! default_decision = "allow"
//! require_approval_for_destructive = true
//! destructive_actions = ["file_delete", "git_push"]
//!
//! [policy.path_scope]
//! mode = "workspace_only"
//! denied_paths = [".git", ".env"]
//!
//! [[policy.rules]]
//! id = "no-force-push"
//! actions = ["bash_execute"]
//! command_patterns = ["git push --force*"]
//! decision = "deny"
//! priority = 100
//! ```

pub mod engine;
pub mod guards;
pub mod overrides;
pub mod types;

pub use engine::PolicyEngine;
pub use guards::{GuardVerdict, NetworkGuard, PathGuard, url_origin};
pub use overrides::{ExecAsk, ExecOverrides, ExecSecurity, derive_exec_overrides};
pub use types::{
    ActionType, Decision, NetworkScope, PathScope, PolicyContext, PolicyDecision, PolicyResult,
    PolicyRule, ScopeMode, WorkflowPolicy,
};

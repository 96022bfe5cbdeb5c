//! Rule evaluation: context → decision.
//!
//! Rules are filtered to those that are enabled, list the action type, and
//! whose declared patterns match the target. The highest `priority` wins;
//! among equal priorities the first-declared rule wins. With no match the
//! policy's `default_decision` applies. The destructive-action override is
//! applied last and can only turn `allow` into `prompt`.

use crate::errors::PolicyError;
use crate::policy::guards::{GuardVerdict, NetworkGuard, PathGuard};
use crate::policy::types::{
    ActionType, Decision, PolicyContext, PolicyDecision, PolicyResult, PolicyRule, WorkflowPolicy,
};
use glob::Pattern;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: PolicyRule,
    paths: Vec<Pattern>,
    commands: Vec<Pattern>,
    urls: Vec<Pattern>,
}

fn compile(rule_id: &str, kind: &'static str, patterns: &[String]) -> Result<Vec<Pattern>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| PolicyError::InvalidPattern {
                rule_id: rule_id.to_string(),
                kind,
                pattern: p.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

impl CompiledRule {
    fn new(rule: PolicyRule) -> Result<Self, PolicyError> {
        Ok(Self {
            paths: compile(&rule.id, "path", &rule.path_patterns)?,
            commands: compile(&rule.id, "command", &rule.command_patterns)?,
            urls: compile(&rule.id, "url", &rule.url_patterns)?,
            rule,
        })
    }

    fn path_matches(&self, ctx: &PolicyContext) -> bool {
        if self.paths.is_empty() {
            return true;
        }
        let Some(target) = &ctx.target_path else {
            return false;
        };
        // Patterns may be written absolute or workspace-relative.
        let relative = ctx
            .workspace_path
            .as_deref()
            .and_then(|ws| target.strip_prefix(ws).ok());
        self.paths.iter().any(|p| {
            p.matches_path(target) || relative.is_some_and(|rel| p.matches_path(rel))
        })
    }

    fn command_matches(&self, ctx: &PolicyContext) -> bool {
        if self.commands.is_empty() {
            return true;
        }
        ctx.command
            .as_deref()
            .is_some_and(|cmd| self.commands.iter().any(|p| p.matches(cmd.trim())))
    }

    fn url_matches(&self, ctx: &PolicyContext) -> bool {
        if self.urls.is_empty() {
            return true;
        }
        ctx.url
            .as_deref()
            .is_some_and(|url| self.urls.iter().any(|p| p.matches(url)))
    }

    fn matches(&self, ctx: &PolicyContext) -> bool {
        self.rule.enabled
            && self.rule.actions.contains(&ctx.action_type)
            && self.path_matches(ctx)
            && self.command_matches(ctx)
            && self.url_matches(ctx)
    }
}

/// Evaluates contexts against one `WorkflowPolicy`.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    policy: WorkflowPolicy,
    rules: Vec<CompiledRule>,
    path_guard: PathGuard,
    network_guard: NetworkGuard,
}

impl PolicyEngine {
    /// Compile a policy. Malformed patterns and duplicate rule ids fail here
    /// rather than at evaluation time.
    pub fn new(policy: WorkflowPolicy) -> Result<Self, PolicyError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            if !seen.insert(rule.id.clone()) {
                return Err(PolicyError::DuplicateRule(rule.id.clone()));
            }
            rules.push(CompiledRule::new(rule.clone())?);
        }
        Ok(Self {
            path_guard: PathGuard::new(&policy.path_scope)?,
            network_guard: NetworkGuard::new(&policy.network_scope)?,
            rules,
            policy,
        })
    }

    pub fn policy(&self) -> &WorkflowPolicy {
        &self.policy
    }

    fn is_destructive(&self, action: ActionType) -> bool {
        self.policy.require_approval_for_destructive
            && self.policy.destructive_actions.contains(&action)
    }

    /// Select the winning rule. Strict `>` keeps the earliest rule on ties.
    fn select(&self, ctx: &PolicyContext) -> Option<&CompiledRule> {
        self.rules
            .iter()
            .filter(|r| r.matches(ctx))
            .fold(None, |best: Option<&CompiledRule>, candidate| match best {
                Some(current) if candidate.rule.priority <= current.rule.priority => Some(current),
                _ => Some(candidate),
            })
    }

    /// Rule-based evaluation, including the destructive-action override.
    pub fn evaluate(&self, ctx: &PolicyContext) -> PolicyResult {
        let winner = self.select(ctx);
        let (base, rule_id, origin) = match winner {
            Some(r) => (
                r.rule.decision,
                Some(r.rule.id.clone()),
                format!("rule '{}'", r.rule.id),
            ),
            None => (self.policy.default_decision, None, "default decision".to_string()),
        };

        let action = ctx.action_type;
        let target = ctx.describe_target();
        let overridden = base == PolicyDecision::Allow && self.is_destructive(action);

        let decision = match base {
            PolicyDecision::Allow if overridden => Decision::Prompt(format!(
                "{} allows {} on {}, but {} is destructive and requires approval",
                origin, action, target, action
            )),
            PolicyDecision::Allow => Decision::Allow,
            PolicyDecision::Deny => {
                Decision::Deny(format!("{} denies {} on {}", origin, action, target))
            }
            PolicyDecision::Prompt => Decision::Prompt(format!(
                "{} requires approval for {} on {}",
                origin, action, target
            )),
        };

        tracing::debug!(
            action = %action,
            target = %target,
            rule_id = rule_id.as_deref().unwrap_or("-"),
            decision = %decision.kind(),
            destructive_override = overridden,
            "policy evaluated"
        );

        PolicyResult {
            action,
            decision,
            rule_id,
            destructive_override: overridden,
        }
    }

    /// Full authorization: scope guards first (hard deny), then rules.
    pub fn authorize(&self, ctx: &PolicyContext) -> PolicyResult {
        let workspace = ctx.workspace_path.as_deref();
        if ctx.action_type.is_file_action()
            && let Some(path) = &ctx.target_path
            && let GuardVerdict::Denied(reason) = self.path_guard.check(path, workspace)
        {
            return self.guard_denial(ctx, reason);
        }
        if let Some(url) = &ctx.url
            && let GuardVerdict::Denied(reason) = self.network_guard.check(url)
        {
            return self.guard_denial(ctx, reason);
        }
        self.evaluate(ctx)
    }

    /// Check a file path against the path scope alone.
    pub fn check_path(&self, path: &Path, workspace: Option<&Path>) -> GuardVerdict {
        self.path_guard.check(path, workspace)
    }

    fn guard_denial(&self, ctx: &PolicyContext, reason: String) -> PolicyResult {
        tracing::debug!(action = %ctx.action_type, %reason, "scope guard denied action");
        PolicyResult {
            action: ctx.action_type,
            decision: Decision::Deny(format!("scope guard: {}", reason)),
            rule_id: None,
            destructive_override: false,
        }
    }
}

//! Direct shell-approval flow, outside the phase policy path.
//!
//! A record is created per request (subject to the per-session rate
//! limiter), resolved exactly once (explicitly or by timeout) and then
//! dropped from the pending map. The audit ring keeps the trail.

use crate::approval::audit::{AuditEntry, AuditKind, AuditRing};
use crate::approval::rate_limit::{RateLimitConfig, RateLimitVerdict, RateLimiter};
use crate::clock::Clock;
use crate::policy::{ExecAsk, ExecSecurity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub session_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecApprovalRecord {
    pub id: String,
    pub request: ExecRequest,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ExecDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

/// Result of `create`: a record, or a rate-limit rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(ExecApprovalRecord),
    RateLimited { retry_after_ms: u64, reason: String },
}

impl CreateOutcome {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CreateOutcome::RateLimited { .. })
    }
}

struct Pending {
    record: ExecApprovalRecord,
    tx: watch::Sender<Option<ExecDecision>>,
}

struct Waiter {
    rx: watch::Receiver<Option<ExecDecision>>,
    expires_at_ms: i64,
}

#[derive(Default)]
struct ManagerState {
    pending: HashMap<String, Pending>,
    waiters: HashMap<String, Waiter>,
}

pub struct ExecApprovalManager {
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    audit: AuditRing,
    state: Mutex<ManagerState>,
    created: Notify,
}

impl ExecApprovalManager {
    pub fn new(limits: RateLimitConfig, audit_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: RateLimiter::new(limits, clock.clone()),
            audit: AuditRing::new(audit_capacity),
            clock,
            state: Mutex::new(ManagerState::default()),
            created: Notify::new(),
        }
    }

    fn audit(&self, kind: AuditKind, session_key: &str, request_id: Option<&str>, detail: String) {
        self.audit.push(AuditEntry {
            at_ms: self.clock.now_ms(),
            kind,
            session_key: session_key.to_string(),
            request_id: request_id.map(str::to_string),
            detail,
        });
    }

    /// Consult the rate limiter, then register a pending record.
    pub fn create(&self, request: ExecRequest, timeout_ms: u64, id: Option<String>) -> CreateOutcome {
        if let RateLimitVerdict::Limited {
            retry_after_ms,
            reason,
        } = self.limiter.check(&request.session_key)
        {
            tracing::warn!(session = %request.session_key, retry_after_ms, "exec approval rate limited");
            self.audit(AuditKind::RateLimited, &request.session_key, None, reason.clone());
            return CreateOutcome::RateLimited {
                retry_after_ms,
                reason,
            };
        }

        self.expire_stale();

        let now = self.clock.now_ms();
        let record = ExecApprovalRecord {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            request,
            created_at_ms: now,
            expires_at_ms: now + timeout_ms as i64,
            resolved_at_ms: None,
            decision: None,
            resolved_by: None,
        };
        let (tx, rx) = watch::channel(None);

        if let Ok(mut state) = self.state.lock() {
            state.waiters.insert(
                record.id.clone(),
                Waiter {
                    rx,
                    expires_at_ms: record.expires_at_ms,
                },
            );
            state.pending.insert(
                record.id.clone(),
                Pending {
                    record: record.clone(),
                    tx,
                },
            );
        }
        self.audit(
            AuditKind::Requested,
            &record.request.session_key,
            Some(&record.id),
            record.request.command.clone(),
        );
        tracing::info!(request_id = %record.id, command = %record.request.command, "exec approval requested");
        self.created.notify_waiters();
        CreateOutcome::Created(record)
    }

    /// Resolve a pending record. Unknown or already-resolved ids return
    /// `false` with no side effect.
    pub fn resolve(&self, id: &str, decision: ExecDecision, resolved_by: Option<&str>) -> bool {
        let Some(mut pending) = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.pending.remove(id))
        else {
            return false;
        };
        pending.record.resolved_at_ms = Some(self.clock.now_ms());
        pending.record.decision = Some(decision);
        pending.record.resolved_by = resolved_by.map(str::to_string);
        let _ = pending.tx.send(Some(decision));

        self.audit(
            AuditKind::Resolved,
            &pending.record.request.session_key,
            Some(id),
            format!("{:?} by {}", decision, resolved_by.unwrap_or("unknown")),
        );
        tracing::info!(request_id = %id, ?decision, "exec approval resolved");
        true
    }

    /// Resolve a record as timed out: drop it from pending without a decision.
    /// Unknown or already-resolved ids are ignored.
    pub fn expire(&self, id: &str) {
        let removed = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| {
                state.waiters.remove(id);
                state.pending.remove(id)
            });
        if let Some(pending) = removed {
            self.audit(
                AuditKind::Expired,
                &pending.record.request.session_key,
                Some(id),
                "timed out".to_string(),
            );
        }
    }

    /// Wait for a decision. Timeout and cancellation both yield `None`.
    pub async fn wait_for_decision(
        &self,
        record: &ExecApprovalRecord,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> Option<ExecDecision> {
        let mut rx = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.waiters.remove(&record.id))?
            .rx;

        if let Some(decision) = *rx.borrow() {
            return Some(decision);
        }

        let outcome = tokio::select! {
            changed = rx.changed() => match changed {
                Ok(()) => *rx.borrow(),
                Err(_) => None,
            },
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
            _ = cancel.cancelled() => None,
        };
        if outcome.is_none() {
            self.expire(&record.id);
        }
        outcome
    }

    pub fn get(&self, id: &str) -> Option<ExecApprovalRecord> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.pending.get(id).map(|p| p.record.clone()))
    }

    pub fn list_pending(&self) -> Vec<ExecApprovalRecord> {
        let mut records: Vec<ExecApprovalRecord> = self
            .state
            .lock()
            .map(|state| state.pending.values().map(|p| p.record.clone()).collect())
            .unwrap_or_default();
        records.sort_by_key(|r| r.created_at_ms);
        records
    }

    /// The oldest pending record, waiting for one to be created if none is.
    /// Returns `None` once `cancel` fires.
    pub async fn next_pending(&self, cancel: &CancellationToken) -> Option<ExecApprovalRecord> {
        loop {
            let created = self.created.notified();
            tokio::pin!(created);
            if let Some(record) = self.list_pending().into_iter().next() {
                return Some(record);
            }
            tokio::select! {
                _ = &mut created => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Drop pending records and unclaimed waiters past their expiry.
    pub fn expire_stale(&self) {
        let now = self.clock.now_ms();
        let expired: Vec<String> = match self.state.lock() {
            Ok(mut state) => {
                let pending_ids: Vec<String> = state.pending.keys().cloned().collect();
                state
                    .waiters
                    .retain(|id, w| w.expires_at_ms > now || pending_ids.contains(id));
                state
                    .pending
                    .values()
                    .filter(|p| p.record.expires_at_ms <= now)
                    .map(|p| p.record.id.clone())
                    .collect()
            }
            Err(_) => return,
        };
        for id in expired {
            self.expire(&id);
        }
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager(max: u32) -> (Arc<ExecApprovalManager>, ManualClock) {
        let clock = ManualClock::new(10_000);
        let manager = ExecApprovalManager::new(
            RateLimitConfig {
                window_ms: 60_000,
                max_per_window: max,
            },
            8,
            Arc::new(clock.clone()),
        );
        (Arc::new(manager), clock)
    }

    fn request(cmd: &str) -> ExecRequest {
        ExecRequest {
            command: cmd.to_string(),
            cwd: None,
            host: Some("gateway".into()),
            security: ExecSecurity::Allowlist,
            ask: ExecAsk::Always,
            agent_id: Some("executor".into()),
            session_key: "session-1".into(),
        }
    }

    fn created(outcome: CreateOutcome) -> ExecApprovalRecord {
        match outcome {
            CreateOutcome::Created(record) => record,
            CreateOutcome::RateLimited { reason, .. } => panic!("unexpected rate limit: {}", reason),
        }
    }

    #[test]
    fn test_create_uses_supplied_id_and_expiry() {
        let (mgr, _clock) = manager(5);
        let record = created(mgr.create(request("ls"), 30_000, Some("fixed".into())));
        assert_eq!(record.id, "fixed");
        assert_eq!(record.expires_at_ms, 40_000);
        assert_eq!(mgr.list_pending().len(), 1);
    }

    #[test]
    fn test_create_rate_limited_is_distinguishable() {
        let (mgr, _clock) = manager(1);
        assert!(!mgr.create(request("ls"), 1_000, None).is_rate_limited());
        let second = mgr.create(request("ls"), 1_000, None);
        assert!(second.is_rate_limited());
        assert!(
            mgr.audit_log()
                .iter()
                .any(|e| e.kind == AuditKind::RateLimited)
        );
    }

    #[test]
    fn test_resolve_is_idempotent_safe() {
        let (mgr, _clock) = manager(5);
        let record = created(mgr.create(request("rm -rf build"), 1_000, None));
        assert!(mgr.resolve(&record.id, ExecDecision::Deny, Some("alice")));
        assert!(!mgr.resolve(&record.id, ExecDecision::AllowOnce, Some("bob")));
        assert!(!mgr.resolve("no-such-id", ExecDecision::AllowOnce, None));
        assert!(mgr.get(&record.id).is_none());
        let resolutions = mgr
            .audit_log()
            .iter()
            .filter(|e| e.kind == AuditKind::Resolved)
            .count();
        assert_eq!(resolutions, 1);
    }

    #[tokio::test]
    async fn test_wait_receives_concurrent_resolution() {
        let (mgr, _clock) = manager(5);
        let record = created(mgr.create(request("cargo publish"), 5_000, None));
        let resolver = mgr.clone();
        let id = record.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(&id, ExecDecision::AllowAlways, Some("ops"));
        });
        let decision = mgr
            .wait_for_decision(&record, 5_000, &CancellationToken::new())
            .await;
        assert_eq!(decision, Some(ExecDecision::AllowAlways));
    }

    #[tokio::test]
    async fn test_wait_sees_resolution_made_before_waiting() {
        let (mgr, _clock) = manager(5);
        let record = created(mgr.create(request("make deploy"), 5_000, None));
        assert!(mgr.resolve(&record.id, ExecDecision::AllowOnce, None));
        let decision = mgr
            .wait_for_decision(&record, 10, &CancellationToken::new())
            .await;
        assert_eq!(decision, Some(ExecDecision::AllowOnce));
    }

    #[tokio::test]
    async fn test_wait_timeout_is_a_value() {
        let (mgr, _clock) = manager(5);
        let record = created(mgr.create(request("sleep 100"), 5_000, None));
        let decision = mgr
            .wait_for_decision(&record, 10, &CancellationToken::new())
            .await;
        assert!(decision.is_none());
        assert!(mgr.list_pending().is_empty());
        assert!(!mgr.resolve(&record.id, ExecDecision::AllowOnce, None));
    }

    #[tokio::test]
    async fn test_cancelled_wait_resolves_early() {
        let (mgr, _clock) = manager(5);
        let record = created(mgr.create(request("npm publish"), 60_000, None));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let decision = mgr.wait_for_decision(&record, 60_000, &cancel).await;
        assert!(decision.is_none());
    }

    #[test]
    fn test_expire_stale_drops_old_records() {
        let (mgr, clock) = manager(5);
        let record = created(mgr.create(request("ls"), 1_000, None));
        clock.advance(1_000);
        mgr.expire_stale();
        assert!(mgr.get(&record.id).is_none());
        assert!(mgr.audit_log().iter().any(|e| e.kind == AuditKind::Expired));
    }

    #[tokio::test]
    async fn test_next_pending_wakes_on_create() {
        let (mgr, _clock) = manager(5);
        let waiter = mgr.clone();
        let next = tokio::spawn(async move { waiter.next_pending(&CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let record = created(mgr.create(request("make release"), 5_000, None));
        let seen = tokio::time::timeout(Duration::from_secs(5), next)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.map(|r| r.id), Some(record.id));
    }

    #[tokio::test]
    async fn test_next_pending_stops_on_cancel() {
        let (mgr, _clock) = manager(5);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(mgr.next_pending(&cancel).await.is_none());
    }

    #[test]
    fn test_expire_drops_pending_request() {
        let (mgr, _clock) = manager(5);
        let record = created(mgr.create(request("ls"), 60_000, None));
        mgr.expire(&record.id);
        mgr.expire("no-such-id");
        assert!(mgr.list_pending().is_empty());
        assert!(!mgr.resolve(&record.id, ExecDecision::AllowOnce, None));
        assert_eq!(
            mgr.audit_log()
                .iter()
                .filter(|e| e.kind == AuditKind::Expired)
                .count(),
            1
        );
    }

    #[test]
    fn test_managers_do_not_share_limiter_state() {
        let (first, _) = manager(1);
        let (second, _) = manager(1);
        assert!(!first.create(request("ls"), 1_000, None).is_rate_limited());
        assert!(!second.create(request("ls"), 1_000, None).is_rate_limited());
    }
}

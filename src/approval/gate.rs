//! Turns a `prompt` policy decision into a durable, answered approval.

use crate::approval::exec::{CreateOutcome, ExecApprovalManager, ExecDecision, ExecRequest};
use crate::approval::store::ApprovalStore;
use crate::approval::types::{
    ApprovalDecision, ApprovalOutcome, ApprovalRecord, ApprovalRequest, RememberScope,
};
use crate::clock::Clock;
use crate::errors::ApprovalError;
use crate::policy::{ExecAsk, ExecSecurity, PolicyContext};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a prompter answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptResponse {
    pub decision: ApprovalDecision,
    pub remember: bool,
    pub remember_scope: Option<RememberScope>,
    pub comment: Option<String>,
}

impl PromptResponse {
    pub fn approved() -> Self {
        Self {
            decision: ApprovalDecision::Approved,
            remember: false,
            remember_scope: None,
            comment: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            decision: ApprovalDecision::Denied,
            ..Self::approved()
        }
    }

    pub fn remembered(mut self, scope: RememberScope) -> Self {
        self.remember = true;
        self.remember_scope = Some(scope);
        self
    }
}

/// Asks someone (or something) for a decision on one request.
#[async_trait]
pub trait ApprovalPrompter: Send + Sync {
    async fn prompt(
        &self,
        request: &ApprovalRequest,
        cancel: CancellationToken,
    ) -> Result<PromptResponse>;

    /// The gate stopped waiting (timeout or cancel) before `prompt` returned.
    fn abandon(&self, _request: &ApprovalRequest) {}
}

/// Answers every request the same way. Used for `--yes` and in tests.
pub struct StaticPrompter {
    response: PromptResponse,
}

impl StaticPrompter {
    pub fn approve() -> Self {
        Self {
            response: PromptResponse::approved(),
        }
    }

    pub fn deny() -> Self {
        Self {
            response: PromptResponse::denied(),
        }
    }

    pub fn with_response(response: PromptResponse) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ApprovalPrompter for StaticPrompter {
    async fn prompt(
        &self,
        _request: &ApprovalRequest,
        _cancel: CancellationToken,
    ) -> Result<PromptResponse> {
        Ok(self.response.clone())
    }
}

/// Publishes requests to an [`ExecApprovalManager`] so an external channel
/// can resolve them by id.
pub struct ExecApprovalPrompter {
    manager: Arc<ExecApprovalManager>,
    session_key: String,
}

impl ExecApprovalPrompter {
    pub fn new(manager: Arc<ExecApprovalManager>, session_key: impl Into<String>) -> Self {
        Self {
            manager,
            session_key: session_key.into(),
        }
    }

    fn exec_request(&self, request: &ApprovalRequest) -> ExecRequest {
        let action = &request.action;
        ExecRequest {
            command: action
                .command
                .clone()
                .unwrap_or_else(|| format!("{} {}", action.action_type, action.describe_target())),
            cwd: action.workspace_path.clone(),
            host: None,
            security: ExecSecurity::Allowlist,
            ask: ExecAsk::Always,
            agent_id: Some(request.phase_id.clone()),
            session_key: self.session_key.clone(),
        }
    }
}

#[async_trait]
impl ApprovalPrompter for ExecApprovalPrompter {
    async fn prompt(
        &self,
        request: &ApprovalRequest,
        cancel: CancellationToken,
    ) -> Result<PromptResponse> {
        let record = match self.manager.create(
            self.exec_request(request),
            request.timeout_ms,
            Some(request.id.clone()),
        ) {
            CreateOutcome::Created(record) => record,
            CreateOutcome::RateLimited { reason, .. } => {
                let mut response = PromptResponse::denied();
                response.comment = Some(format!("rate limited: {}", reason));
                return Ok(response);
            }
        };

        let response = match self
            .manager
            .wait_for_decision(&record, request.timeout_ms, &cancel)
            .await
        {
            Some(ExecDecision::AllowOnce) => PromptResponse::approved(),
            Some(ExecDecision::AllowAlways) => {
                PromptResponse::approved().remembered(RememberScope::Run)
            }
            Some(ExecDecision::Deny) => PromptResponse::denied(),
            None => PromptResponse {
                decision: ApprovalDecision::Timeout,
                ..PromptResponse::denied()
            },
        };
        Ok(response)
    }

    fn abandon(&self, request: &ApprovalRequest) {
        self.manager.expire(&request.id);
    }
}

/// Outcome of one gate pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub outcome: ApprovalOutcome,
    pub request_id: String,
    /// True when a remembered record answered without prompting.
    pub remembered: bool,
}

pub struct ApprovalGate {
    store: Arc<dyn ApprovalStore>,
    prompter: Arc<dyn ApprovalPrompter>,
    clock: Arc<dyn Clock>,
    timeout_ms: u64,
}

impl ApprovalGate {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        prompter: Arc<dyn ApprovalPrompter>,
        clock: Arc<dyn Clock>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            prompter,
            clock,
            timeout_ms,
        }
    }

    pub fn store(&self) -> &Arc<dyn ApprovalStore> {
        &self.store
    }

    /// Resolve one prompt decision. Denials and timeouts are outcomes, not
    /// errors; only store failures are returned as `Err`.
    pub async fn request_approval(
        &self,
        run_id: &str,
        phase_id: &str,
        action: PolicyContext,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<GateResult, ApprovalError> {
        let request = ApprovalRequest::new(
            run_id,
            phase_id,
            action,
            reason,
            self.clock.now_ms(),
            self.timeout_ms,
        );

        if let Some(previous) = self.store.find_matching(&request)? {
            tracing::info!(
                run_id,
                phase = phase_id,
                matched = %previous.id(),
                decision = %previous.decision,
                "approval answered by remembered decision"
            );
            return Ok(GateResult {
                outcome: previous.decision.into(),
                request_id: request.id,
                remembered: true,
            });
        }

        tracing::info!(
            run_id,
            phase = phase_id,
            request_id = %request.id,
            action = %request.action.action_type,
            "approval requested"
        );

        let (response, answered) = tokio::select! {
            answer = self.prompter.prompt(&request, cancel.clone()) => match answer {
                Ok(response) => (response, true),
                Err(e) => {
                    tracing::warn!(request_id = %request.id, error = %e, "prompter failed, treating as denied");
                    let response = PromptResponse {
                        comment: Some(format!("prompter error: {}", e)),
                        ..PromptResponse::denied()
                    };
                    (response, true)
                }
            },
            _ = tokio::time::sleep(Duration::from_millis(self.timeout_ms)) => (PromptResponse {
                decision: ApprovalDecision::Timeout,
                ..PromptResponse::denied()
            }, false),
            _ = cancel.cancelled() => (PromptResponse {
                decision: ApprovalDecision::Timeout,
                comment: Some("cancelled".to_string()),
                ..PromptResponse::denied()
            }, false),
        };
        if !answered {
            self.prompter.abandon(&request);
        }

        let record = ApprovalRecord {
            decision: response.decision,
            decided_at_ms: self.clock.now_ms(),
            remember: response.remember && response.decision != ApprovalDecision::Timeout,
            remember_scope: response.remember_scope,
            comment: response.comment,
            request,
        };
        self.store.save(&record)?;

        tracing::info!(request_id = %record.id(), decision = %record.decision, "approval decided");
        Ok(GateResult {
            outcome: record.decision.into(),
            request_id: record.request.id,
            remembered: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::rate_limit::RateLimitConfig;
    use crate::approval::store::MemoryApprovalStore;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrompter {
        calls: AtomicUsize,
        response: PromptResponse,
    }

    #[async_trait]
    impl ApprovalPrompter for CountingPrompter {
        async fn prompt(
            &self,
            _request: &ApprovalRequest,
            _cancel: CancellationToken,
        ) -> Result<PromptResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    struct NeverPrompter;

    #[async_trait]
    impl ApprovalPrompter for NeverPrompter {
        async fn prompt(
            &self,
            _request: &ApprovalRequest,
            cancel: CancellationToken,
        ) -> Result<PromptResponse> {
            cancel.cancelled().await;
            anyhow::bail!("cancelled")
        }
    }

    struct FailingPrompter;

    #[async_trait]
    impl ApprovalPrompter for FailingPrompter {
        async fn prompt(
            &self,
            _request: &ApprovalRequest,
            _cancel: CancellationToken,
        ) -> Result<PromptResponse> {
            anyhow::bail!("terminal closed")
        }
    }

    fn gate(prompter: Arc<dyn ApprovalPrompter>, timeout_ms: u64) -> (ApprovalGate, Arc<MemoryApprovalStore>) {
        let store = Arc::new(MemoryApprovalStore::new());
        let gate = ApprovalGate::new(
            store.clone(),
            prompter,
            Arc::new(ManualClock::new(0)),
            timeout_ms,
        );
        (gate, store)
    }

    #[tokio::test]
    async fn test_static_prompter_records_decision() {
        let (gate, store) = gate(Arc::new(StaticPrompter::deny()), 1_000);
        let result = gate
            .request_approval(
                "run-1",
                "execute",
                PolicyContext::command("git push origin main"),
                "destructive",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, ApprovalOutcome::Denied);
        assert!(!result.remembered);
        let records = store.list_for_run("run-1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), result.request_id);
    }

    #[tokio::test]
    async fn test_remembered_decision_skips_prompt() {
        let prompter = Arc::new(CountingPrompter {
            calls: AtomicUsize::new(0),
            response: PromptResponse::approved().remembered(RememberScope::Run),
        });
        let (gate, _store) = gate(prompter.clone(), 1_000);
        let cancel = CancellationToken::new();

        let first = gate
            .request_approval("run-1", "execute", PolicyContext::command("npm install"), "r", &cancel)
            .await
            .unwrap();
        let second = gate
            .request_approval("run-1", "execute", PolicyContext::command("npm test"), "r", &cancel)
            .await
            .unwrap();
        assert_eq!(first.outcome, ApprovalOutcome::Approved);
        assert_eq!(second.outcome, ApprovalOutcome::Approved);
        assert!(second.remembered);
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);

        // A different run is not covered by a run-scoped memory.
        gate.request_approval("run-2", "execute", PolicyContext::command("npm test"), "r", &cancel)
            .await
            .unwrap();
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_an_outcome() {
        let (gate, store) = gate(Arc::new(NeverPrompter), 10);
        let result = gate
            .request_approval(
                "run-1",
                "execute",
                PolicyContext::command("rm -rf /tmp/x"),
                "r",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, ApprovalOutcome::TimedOut);
        assert_eq!(store.list_for_run("run-1").unwrap()[0].decision, ApprovalDecision::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_resolves_wait_early() {
        let (gate, _store) = gate(Arc::new(NeverPrompter), 60_000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = gate
            .request_approval("run-1", "execute", PolicyContext::command("ls"), "r", &cancel)
            .await
            .unwrap();
        assert_eq!(result.outcome, ApprovalOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_prompter_error_is_denial() {
        let (gate, _store) = gate(Arc::new(FailingPrompter), 1_000);
        let result = gate
            .request_approval("run-1", "execute", PolicyContext::command("ls"), "r", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outcome, ApprovalOutcome::Denied);
    }

    #[tokio::test]
    async fn test_exec_prompter_bridges_external_resolution() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = Arc::new(ExecApprovalManager::new(
            RateLimitConfig::default(),
            16,
            clock.clone(),
        ));
        let prompter = Arc::new(ExecApprovalPrompter::new(manager.clone(), "cli"));
        let store = Arc::new(MemoryApprovalStore::new());
        let gate = ApprovalGate::new(store.clone(), prompter, clock, 5_000);

        let resolver = manager.clone();
        tokio::spawn(async move {
            loop {
                if let Some(pending) = resolver.list_pending().first() {
                    resolver.resolve(&pending.id, ExecDecision::AllowAlways, Some("operator"));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = gate
            .request_approval(
                "run-1",
                "execute",
                PolicyContext::command("cargo publish"),
                "r",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, ApprovalOutcome::Approved);
        let saved = &store.list_for_run("run-1").unwrap()[0];
        assert!(saved.remember);
        assert_eq!(saved.remember_scope, Some(RememberScope::Run));
    }

    fn exec_manager(max_per_window: u32) -> Arc<ExecApprovalManager> {
        Arc::new(ExecApprovalManager::new(
            RateLimitConfig {
                window_ms: 60_000,
                max_per_window,
            },
            16,
            Arc::new(ManualClock::new(0)),
        ))
    }

    #[tokio::test]
    async fn test_abandon_releases_pending_exec_request() {
        let manager = exec_manager(5);
        let prompter = Arc::new(ExecApprovalPrompter::new(manager.clone(), "cli"));
        let request = ApprovalRequest::new(
            "run-1",
            "execute",
            PolicyContext::command("terraform apply"),
            "r",
            0,
            60_000,
        );

        let waiting = prompter.clone();
        let pending_request = request.clone();
        let handle = tokio::spawn(async move {
            waiting.prompt(&pending_request, CancellationToken::new()).await
        });
        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            manager.next_pending(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(seen.id, request.id);

        // The gate drops the prompt future when its own wait ends.
        handle.abort();
        prompter.abandon(&request);
        assert!(manager.list_pending().is_empty());
        assert!(!manager.resolve(&request.id, ExecDecision::AllowOnce, Some("late")));
    }

    #[tokio::test]
    async fn test_gate_timeout_leaves_no_pending_exec_request() {
        let manager = exec_manager(5);
        let prompter = Arc::new(ExecApprovalPrompter::new(manager.clone(), "cli"));
        let store = Arc::new(MemoryApprovalStore::new());
        let gate = ApprovalGate::new(store.clone(), prompter, Arc::new(ManualClock::new(0)), 20);

        let result = gate
            .request_approval(
                "run-1",
                "execute",
                PolicyContext::command("kubectl delete ns prod"),
                "r",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, ApprovalOutcome::TimedOut);
        assert!(manager.list_pending().is_empty());
        assert!(!manager.resolve(&result.request_id, ExecDecision::AllowOnce, None));
    }

    #[tokio::test]
    async fn test_exec_prompter_rate_limit_denies() {
        let manager = exec_manager(1);
        let prompter = Arc::new(ExecApprovalPrompter::new(manager.clone(), "cli"));
        let store = Arc::new(MemoryApprovalStore::new());
        let gate = ApprovalGate::new(store.clone(), prompter, Arc::new(ManualClock::new(0)), 5_000);

        let resolver = manager.clone();
        let stop = CancellationToken::new();
        let stop_resolver = stop.clone();
        tokio::spawn(async move {
            while let Some(pending) = resolver.next_pending(&stop_resolver).await {
                resolver.resolve(&pending.id, ExecDecision::AllowOnce, Some("auto"));
            }
        });

        let cancel = CancellationToken::new();
        let first = gate
            .request_approval("run-1", "plan", PolicyContext::command("ls"), "r", &cancel)
            .await
            .unwrap();
        let second = gate
            .request_approval("run-1", "review", PolicyContext::command("pwd"), "r", &cancel)
            .await
            .unwrap();
        stop.cancel();

        assert_eq!(first.outcome, ApprovalOutcome::Approved);
        assert_eq!(second.outcome, ApprovalOutcome::Denied);
        let records = store.list_for_run("run-1").unwrap();
        assert!(
            records[1]
                .comment
                .as_deref()
                .is_some_and(|c| c.starts_with("rate limited"))
        );
    }
}

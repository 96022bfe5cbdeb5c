//! The workflow state machine.
//!
//! A run moves `pending → running → {completed | failed | aborted}`. Phases
//! execute one at a time. Before each phase the wall-clock budget is checked;
//! before each live agent call the agent-run budget is reserved. Policy
//! `deny` and approval `denied`/`timeout` fail the phase without retry; agent
//! failures and missing artifacts are retried up to the phase's `retries`.
//! Event logging and state saves during `execute` never abort the run.

use crate::approval::{ApprovalGate, ApprovalOutcome};
use crate::clock::Clock;
use crate::errors::OrchestratorError;
use crate::handoff::{HandoffBuilder, HandoffRequest};
use crate::policy::{
    ActionType, Decision, ExecOverrides, PolicyContext, PolicyEngine, WorkflowPolicy,
    derive_exec_overrides,
};
use crate::runtime::{AgentRequest, AgentRunner, ArtifactStore, WorkflowPersistence, WorkspaceManager};
use crate::workflow::condition;
use crate::workflow::definition::{DefinitionRegistry, EngineRole, PhaseDefinition, WorkflowDefinition};
use crate::workflow::events::{WorkflowEvent, WorkflowEventType};
use crate::workflow::types::{
    PhaseExecution, PhaseStatus, RunStatus, WorkflowInput, WorkflowRun, WorkspaceConfig,
    WorkspaceMode,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// External collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub persistence: Arc<dyn WorkflowPersistence>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub agent: Arc<dyn AgentRunner>,
    pub gate: Arc<ApprovalGate>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Call the agent runner. Otherwise deterministic stub output is used.
    pub live: bool,
    /// Policy copied into every new run.
    pub policy: WorkflowPolicy,
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Replaces each phase's own agent timeout when set.
    pub agent_timeout_ms: Option<u64>,
    /// Leave worktree/copy workspaces on disk after the run.
    pub keep_workspace: bool,
}

/// How a failed attempt affects the phase.
#[derive(Debug)]
enum AttemptError {
    /// Try again while retries remain.
    Retry(String),
    /// Fail the phase now.
    NoRetry(String),
    /// Fail the run now.
    Fatal(OrchestratorError),
}

enum PhaseOutcome {
    Completed(Vec<String>),
    Skipped,
}

/// Everything fixed for the duration of one phase entry.
struct PhaseScope<'a> {
    definition: &'a WorkflowDefinition,
    phase: &'a PhaseDefinition,
    iteration: u32,
    engine: &'a PolicyEngine,
    exec: ExecOverrides,
    workspace: &'a Path,
    previous_phase: Option<String>,
    cancel: &'a CancellationToken,
}

pub struct WorkflowOrchestrator {
    registry: DefinitionRegistry,
    deps: Collaborators,
    options: OrchestratorOptions,
}

impl WorkflowOrchestrator {
    pub fn new(
        registry: DefinitionRegistry,
        deps: Collaborators,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            registry,
            deps,
            options,
        }
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Create and persist a pending run.
    pub async fn start(
        &self,
        workflow_type: &str,
        input: WorkflowInput,
        workspace: WorkspaceConfig,
    ) -> Result<WorkflowRun, OrchestratorError> {
        self.registry.get(workflow_type)?;
        // Malformed policies fail here rather than mid-run.
        PolicyEngine::new(self.options.policy.clone())?;

        let run = WorkflowRun::new(
            workflow_type,
            input,
            workspace,
            self.options.live,
            self.options.policy.clone(),
            self.deps.clock.now_ms(),
        );
        self.deps
            .persistence
            .save_workflow_state(&run)
            .await
            .map_err(OrchestratorError::Persistence)?;
        tracing::info!(run_id = %run.id, workflow = workflow_type, live = run.live, "workflow run created");
        Ok(run)
    }

    pub async fn load(&self, run_id: &str) -> Result<WorkflowRun, OrchestratorError> {
        self.deps
            .persistence
            .load_workflow_state(run_id)
            .await
            .map_err(OrchestratorError::Persistence)?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Drive a pending run to a terminal status.
    ///
    /// Returns the completed run, or the error that failed or aborted it.
    /// Either way the terminal state has been persisted.
    pub async fn execute(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, OrchestratorError> {
        let mut run = self.load(run_id).await?;
        let definition = self.registry.get(&run.workflow_type)?.clone();
        let engine = PolicyEngine::new(run.policy.clone())?;

        run.transition(RunStatus::Running, self.deps.clock.now_ms())?;
        self.emit(self.event(&run.id, WorkflowEventType::WorkflowStart).with_data(json!({
            "workflow_type": run.workflow_type,
            "live": run.live,
            "task": run.input.task,
            "workspace_mode": run.workspace.mode.to_string(),
        })))
        .await;
        self.persist(&mut run).await;

        let mut outcome = self.drive(&mut run, &definition, &engine, cancel).await;
        if outcome.is_ok() {
            outcome = self.check_success_criteria(&run, &definition).await;
        }
        self.cleanup(&mut run).await;

        let now = self.deps.clock.now_ms();
        match &outcome {
            Ok(()) => {
                run.transition(RunStatus::Completed, now)?;
                tracing::info!(run_id = %run.id, phases = run.phase_history.len(), "workflow completed");
                self.emit(
                    self.event(&run.id, WorkflowEventType::WorkflowComplete)
                        .with_data(serde_json::to_value(run.summary()).unwrap_or_default()),
                )
                .await;
            }
            Err(OrchestratorError::Aborted { .. }) => {
                run.transition(RunStatus::Aborted, now)?;
                run.error = Some("cancelled".to_string());
                tracing::warn!(run_id = %run.id, "workflow aborted");
                self.emit(self.event(&run.id, WorkflowEventType::WorkflowAbort))
                    .await;
            }
            Err(e) => {
                run.transition(RunStatus::Failed, now)?;
                run.error = Some(e.to_string());
                tracing::error!(run_id = %run.id, error = %e, "workflow failed");
                self.emit(self.event(&run.id, WorkflowEventType::WorkflowFail).with_data(json!({
                    "error": e.to_string(),
                    "safety_limit": e.is_safety_limit(),
                })))
                .await;
            }
        }
        self.persist(&mut run).await;
        outcome.map(|()| run)
    }

    /// Set up the workspace and run phases until the end of the definition.
    async fn drive(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
        engine: &PolicyEngine,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(self.aborted(run));
        }
        let workspace = self
            .deps
            .workspaces
            .setup_workspace(&run.id, &run.workspace)
            .await
            .map_err(OrchestratorError::Workspace)?;
        run.workspace_path = Some(workspace.clone());
        self.persist(run).await;

        let exec = derive_exec_overrides(engine);
        let settings = &definition.settings;
        let mut entries: HashMap<&str, u32> = HashMap::new();
        let mut index = 0;

        while index < definition.phases.len() {
            let phase = &definition.phases[index];
            if cancel.is_cancelled() {
                return Err(self.aborted(run));
            }
            self.check_duration(run, definition)?;

            let iteration = {
                let count = entries.entry(phase.id.as_str()).or_insert(0);
                *count += 1;
                *count
            };
            let scope = PhaseScope {
                definition,
                phase,
                iteration,
                engine,
                exec,
                workspace: &workspace,
                previous_phase: run.last_phase_id().map(str::to_string),
                cancel,
            };

            let artifacts = match self.run_phase(run, &scope).await? {
                PhaseOutcome::Completed(artifacts) => artifacts,
                PhaseOutcome::Skipped => {
                    index += 1;
                    continue;
                }
            };
            let outputs = self
                .load_outputs(&run.id, &phase.id, iteration, &artifacts)
                .await;

            if phase.engine == EngineRole::Planner {
                check_max_tasks(&outputs, settings.max_tasks)?;
            }

            if let Some(repeat) = &phase.repeat
                && condition::evaluate(&repeat.condition, &condition_root(&outputs))
            {
                if iteration < settings.max_review_iterations {
                    let target = repeat
                        .goto
                        .as_deref()
                        .and_then(|id| definition.phase_index(id))
                        .unwrap_or(index);
                    run.review_iterations += 1;
                    tracing::info!(
                        run_id = %run.id,
                        phase = %phase.id,
                        iteration,
                        goto = %definition.phases[target].id,
                        "repeat condition holds, going back"
                    );
                    self.persist(run).await;
                    index = target;
                    continue;
                }
                run.review_iterations_exhausted = true;
                tracing::warn!(
                    run_id = %run.id,
                    phase = %phase.id,
                    limit = settings.max_review_iterations,
                    "maxReviewIterations reached, advancing"
                );
                self.persist(run).await;
            }
            index += 1;
        }
        Ok(())
    }

    fn check_duration(
        &self,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        let elapsed = (self.deps.clock.now_ms() - run.started_at_ms).max(0) as u64;
        let limit = definition.settings.max_duration_ms;
        if elapsed > limit {
            return Err(OrchestratorError::WorkflowTimeout {
                limit_ms: limit,
                elapsed_ms: elapsed,
            });
        }
        Ok(())
    }

    fn aborted(&self, run: &WorkflowRun) -> OrchestratorError {
        OrchestratorError::Aborted {
            run_id: run.id.clone(),
        }
    }

    /// Authorize, attempt with retries, and record the phase in the history.
    async fn run_phase(
        &self,
        run: &mut WorkflowRun,
        scope: &PhaseScope<'_>,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let phase = scope.phase;
        let started_at_ms = self.deps.clock.now_ms();
        tracing::info!(run_id = %run.id, phase = %phase.id, iteration = scope.iteration, engine = %phase.engine, "phase starting");
        self.emit(self.phase_event(run, scope, WorkflowEventType::PhaseStart).with_data(json!({
            "engine": phase.engine.as_str(),
            "previous_phase": scope.previous_phase,
        })))
        .await;

        let mut attempts = 0;
        let result = match self.authorize_phase(run, scope).await {
            Ok(()) => self.attempt_with_retries(run, scope, &mut attempts).await,
            Err(e) => Err(e),
        };

        let mut execution = PhaseExecution {
            phase_id: phase.id.clone(),
            engine: phase.engine,
            iteration: scope.iteration,
            attempts,
            status: PhaseStatus::Completed,
            started_at_ms,
            finished_at_ms: self.deps.clock.now_ms(),
            artifacts: Vec::new(),
            error: None,
        };

        let message = match result {
            Ok(artifacts) => {
                execution.artifacts = artifacts.clone();
                run.phase_history.push(execution);
                self.persist(run).await;
                tracing::info!(run_id = %run.id, phase = %phase.id, iteration = scope.iteration, attempts, "phase completed");
                self.emit(self.phase_event(run, scope, WorkflowEventType::PhaseComplete).with_data(json!({
                    "attempts": attempts,
                    "artifacts": artifacts,
                })))
                .await;
                return Ok(PhaseOutcome::Completed(artifacts));
            }
            Err(AttemptError::Fatal(e)) => {
                execution.status = PhaseStatus::Failed;
                execution.error = Some(e.to_string());
                run.phase_history.push(execution);
                self.emit(self.phase_event(run, scope, WorkflowEventType::PhaseFail).with_data(json!({
                    "error": e.to_string(),
                    "fatal": true,
                })))
                .await;
                self.persist(run).await;
                return Err(e);
            }
            Err(AttemptError::Retry(message)) | Err(AttemptError::NoRetry(message)) => message,
        };

        tracing::warn!(run_id = %run.id, phase = %phase.id, attempts, error = %message, "phase failed");
        self.emit(self.phase_event(run, scope, WorkflowEventType::PhaseFail).with_data(json!({
            "error": message,
            "attempts": attempts,
        })))
        .await;

        execution.error = Some(message.clone());
        if phase.non_fatal {
            execution.status = PhaseStatus::Skipped;
            run.phase_history.push(execution);
            self.emit(self.phase_event(run, scope, WorkflowEventType::PhaseSkip).with_data(json!({
                "reason": message,
            })))
            .await;
            self.persist(run).await;
            return Ok(PhaseOutcome::Skipped);
        }

        execution.status = PhaseStatus::Failed;
        run.phase_history.push(execution);
        self.persist(run).await;
        Err(OrchestratorError::PhaseFailed {
            phase: phase.id.clone(),
            attempts,
            message,
        })
    }

    async fn attempt_with_retries(
        &self,
        run: &mut WorkflowRun,
        scope: &PhaseScope<'_>,
        attempts: &mut u32,
    ) -> Result<Vec<String>, AttemptError> {
        let retries = scope.phase.settings.retries;
        let mut last_error = String::new();
        for attempt in 0..=retries {
            if scope.cancel.is_cancelled() {
                return Err(AttemptError::Fatal(self.aborted(run)));
            }
            if attempt > 0 {
                self.check_duration(run, scope.definition)
                    .map_err(AttemptError::Fatal)?;
            }
            *attempts = attempt + 1;
            match self.attempt(run, scope).await {
                Ok(artifacts) => return Ok(artifacts),
                Err(AttemptError::Retry(message)) => {
                    tracing::warn!(
                        run_id = %run.id,
                        phase = %scope.phase.id,
                        attempt = attempt + 1,
                        max_attempts = retries + 1,
                        error = %message,
                        "phase attempt failed"
                    );
                    last_error = message;
                }
                Err(other) => return Err(other),
            }
        }
        Err(AttemptError::Retry(last_error))
    }

    /// Authorize every action the phase needs before any agent runs.
    async fn authorize_phase(
        &self,
        run: &mut WorkflowRun,
        scope: &PhaseScope<'_>,
    ) -> Result<(), AttemptError> {
        for action in scope.phase.effective_required_actions() {
            let ctx = if action.is_file_action() {
                PolicyContext::file(action, scope.workspace)
            } else {
                PolicyContext::action(action)
            }
            .in_workspace(scope.workspace);

            self.emit(self.phase_event(run, scope, WorkflowEventType::PolicyEvaluate).with_data(json!({
                "action": action.as_str(),
                "target": ctx.describe_target(),
            })))
            .await;
            let result = scope.engine.authorize(&ctx);
            let rule_id = result.rule_id.clone().unwrap_or_else(|| "-".to_string());

            match &result.decision {
                Decision::Allow => {
                    self.emit(self.phase_event(run, scope, WorkflowEventType::PolicyAllow).with_data(json!({
                        "action": action.as_str(),
                        "rule_id": result.rule_id,
                    })))
                    .await;
                }
                Decision::Deny(reason) => {
                    tracing::warn!(run_id = %run.id, phase = %scope.phase.id, action = %action, rule_id = %rule_id, "policy denied action");
                    self.emit(self.phase_event(run, scope, WorkflowEventType::PolicyDeny).with_data(json!({
                        "action": action.as_str(),
                        "rule_id": result.rule_id,
                        "reason": reason,
                    })))
                    .await;
                    return Err(AttemptError::NoRetry(format!(
                        "policy denied {} (rule {}): {}",
                        action, rule_id, reason
                    )));
                }
                Decision::Prompt(reason) => {
                    self.emit(self.phase_event(run, scope, WorkflowEventType::PolicyPrompt).with_data(json!({
                        "action": action.as_str(),
                        "rule_id": result.rule_id,
                        "reason": reason,
                        "destructive_override": result.destructive_override,
                    })))
                    .await;
                    self.seek_approval(run, scope, action, ctx, reason).await?;
                }
            }
        }
        Ok(())
    }

    async fn seek_approval(
        &self,
        run: &mut WorkflowRun,
        scope: &PhaseScope<'_>,
        action: ActionType,
        ctx: PolicyContext,
        reason: &str,
    ) -> Result<(), AttemptError> {
        self.emit(self.phase_event(run, scope, WorkflowEventType::ApprovalRequest).with_data(json!({
            "action": action.as_str(),
            "reason": reason,
        })))
        .await;
        run.approval_count += 1;

        let gate = self
            .deps
            .gate
            .request_approval(&run.id, &scope.phase.id, ctx, reason, scope.cancel)
            .await
            .map_err(|e| AttemptError::NoRetry(format!("approval store failed: {}", e)))?;

        let data = json!({
            "action": action.as_str(),
            "request_id": gate.request_id,
            "remembered": gate.remembered,
        });
        match gate.outcome {
            ApprovalOutcome::Approved => {
                self.emit(self.phase_event(run, scope, WorkflowEventType::ApprovalApproved).with_data(data))
                    .await;
                Ok(())
            }
            ApprovalOutcome::Denied => {
                self.emit(self.phase_event(run, scope, WorkflowEventType::ApprovalDenied).with_data(data))
                    .await;
                Err(AttemptError::NoRetry(format!(
                    "approval denied for {}: {}",
                    action, reason
                )))
            }
            ApprovalOutcome::TimedOut => {
                if scope.cancel.is_cancelled() {
                    return Err(AttemptError::Fatal(self.aborted(run)));
                }
                self.emit(self.phase_event(run, scope, WorkflowEventType::ApprovalTimeout).with_data(data))
                    .await;
                Err(AttemptError::NoRetry(format!(
                    "approval timed out for {}: {}",
                    action, reason
                )))
            }
        }
    }

    /// One attempt: stage inputs, write the handoff, produce and validate outputs.
    async fn attempt(
        &self,
        run: &mut WorkflowRun,
        scope: &PhaseScope<'_>,
    ) -> Result<Vec<String>, AttemptError> {
        let phase = scope.phase;
        let artifacts = &self.deps.artifacts;

        for input in &phase.input_artifacts {
            let Some((from_phase, from_iteration)) = run
                .latest_producer(input)
                .map(|p| (p.phase_id.clone(), p.iteration))
            else {
                return Err(missing(&phase.id, input));
            };
            let content = artifacts
                .load_artifact(&run.id, &from_phase, from_iteration, input)
                .await
                .map_err(|e| {
                    AttemptError::NoRetry(format!("failed to load artifact '{}': {:#}", input, e))
                })?
                .ok_or_else(|| missing(&phase.id, input))?;
            artifacts
                .save_artifact(&run.id, &phase.id, scope.iteration, input, &content)
                .await
                .map_err(|e| {
                    AttemptError::NoRetry(format!("failed to stage artifact '{}': {:#}", input, e))
                })?;
            self.emit(self.phase_event(run, scope, WorkflowEventType::ArtifactLoad).with_data(json!({
                "name": input,
                "from_phase": from_phase,
                "from_iteration": from_iteration,
            })))
            .await;
        }

        let changes = self
            .deps
            .workspaces
            .changed_files(scope.workspace)
            .await
            .map_err(|e| format!("{:#}", e));
        let diff_summary = match self.deps.workspaces.diff_summary(scope.workspace).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(error = %e, "diff summary unavailable");
                Vec::new()
            }
        };
        let package = HandoffBuilder::new().build(HandoffRequest {
            workflow_id: run.id.clone(),
            phase_id: phase.id.clone(),
            engine: phase.engine,
            iteration: scope.iteration,
            previous_phase: scope.previous_phase.clone(),
            task: run.input.task.clone(),
            workspace: scope.workspace.to_path_buf(),
            input_artifacts: phase.input_artifacts.clone(),
            output_artifacts: phase.output_artifacts.clone(),
            timeout_ms: phase.settings.timeout_ms,
            changes,
            diff_summary,
        });
        artifacts
            .save_handoff(&run.id, &phase.id, scope.iteration, &package)
            .await
            .map_err(|e| AttemptError::NoRetry(format!("failed to save handoff: {:#}", e)))?;

        let produced = if run.live {
            self.invoke_agent(run, scope, package.prompt()).await?
        } else {
            stub_outputs(phase, &run.input.task)
        };
        for (name, content) in &produced {
            artifacts
                .save_artifact(&run.id, &phase.id, scope.iteration, name, content)
                .await
                .map_err(|e| {
                    AttemptError::NoRetry(format!("failed to save artifact '{}': {:#}", name, e))
                })?;
            self.emit(self.phase_event(run, scope, WorkflowEventType::ArtifactSave).with_data(json!({
                "name": name,
                "bytes": content.len(),
            })))
            .await;
        }

        for name in &phase.output_artifacts {
            let content = artifacts
                .load_artifact(&run.id, &phase.id, scope.iteration, name)
                .await
                .map_err(|e| {
                    AttemptError::NoRetry(format!("failed to read artifact '{}': {:#}", name, e))
                })?
                .ok_or_else(|| missing(&phase.id, name))?;
            if is_json(name) && let Err(e) = serde_json::from_str::<Value>(&content) {
                return Err(AttemptError::Retry(format!(
                    "artifact '{}' from phase {} is not valid JSON: {}",
                    name, phase.id, e
                )));
            }
        }
        Ok(phase.output_artifacts.clone())
    }

    /// Reserve agent budget, then run the agent against timeout and cancellation.
    async fn invoke_agent(
        &self,
        run: &mut WorkflowRun,
        scope: &PhaseScope<'_>,
        prompt: String,
    ) -> Result<BTreeMap<String, String>, AttemptError> {
        let phase = scope.phase;
        let limit = scope.definition.settings.max_agent_runs;
        if run.agent_run_count >= limit {
            return Err(AttemptError::Fatal(OrchestratorError::AgentRunLimitExceeded {
                limit,
                attempted: run.agent_run_count + 1,
                phase: phase.id.clone(),
            }));
        }
        run.agent_run_count += 1;
        self.persist(run).await;

        let timeout_ms = self
            .options
            .agent_timeout_ms
            .unwrap_or(phase.settings.timeout_ms);

        let request = AgentRequest {
            session_id: format!("{}:{}:{}", run.id, phase.id, scope.iteration),
            phase_id: phase.id.clone(),
            engine: phase.engine,
            iteration: scope.iteration,
            prompt,
            workspace_path: scope.workspace.to_path_buf(),
            artifacts_dir: self
                .deps
                .artifacts
                .artifacts_dir(&run.id, &phase.id, scope.iteration),
            timeout_ms,
            model: self.options.model.clone(),
            provider: self.options.provider.clone(),
            exec: scope.exec,
        };
        self.emit(self.phase_event(run, scope, WorkflowEventType::AgentStart).with_data(json!({
            "session_id": request.session_id,
            "agent_run": run.agent_run_count,
            "limit": limit,
        })))
        .await;

        let result = tokio::select! {
            result = self.deps.agent.run(request, scope.cancel.child_token()) => result,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                self.emit(self.phase_event(run, scope, WorkflowEventType::AgentTimeout).with_data(json!({
                    "timeout_ms": timeout_ms,
                })))
                .await;
                return Err(AttemptError::Retry(format!("agent timed out after {}ms", timeout_ms)));
            }
            _ = scope.cancel.cancelled() => {
                return Err(AttemptError::Fatal(self.aborted(run)));
            }
        };

        match result {
            Ok(response) if response.success => {
                self.emit(self.phase_event(run, scope, WorkflowEventType::AgentComplete).with_data(json!({
                    "duration_ms": response.metrics.duration_ms,
                    "output_chars": response.output.len(),
                    "artifacts": response.artifacts.keys().collect::<Vec<_>>(),
                })))
                .await;
                Ok(response.artifacts)
            }
            Ok(response) => {
                let error = response
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.emit(self.phase_event(run, scope, WorkflowEventType::AgentFail).with_data(json!({
                    "error": error,
                })))
                .await;
                Err(AttemptError::Retry(error))
            }
            Err(_) if scope.cancel.is_cancelled() => Err(AttemptError::Fatal(self.aborted(run))),
            Err(e) => {
                let error = format!("{:#}", e);
                self.emit(self.phase_event(run, scope, WorkflowEventType::AgentFail).with_data(json!({
                    "error": error,
                })))
                .await;
                Err(AttemptError::Retry(error))
            }
        }
    }

    async fn load_outputs(
        &self,
        run_id: &str,
        phase_id: &str,
        iteration: u32,
        names: &[String],
    ) -> Vec<(String, Value)> {
        let mut outputs = Vec::with_capacity(names.len());
        for name in names {
            match self
                .deps
                .artifacts
                .load_artifact(run_id, phase_id, iteration, name)
                .await
            {
                Ok(Some(content)) => {
                    let value = serde_json::from_str(&content).unwrap_or(Value::String(content));
                    outputs.push((name.clone(), value));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(run_id, phase = phase_id, artifact = %name, error = %e, "failed to reload artifact")
                }
            }
        }
        outputs
    }

    async fn check_success_criteria(
        &self,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        for criterion in &definition.settings.success_criteria {
            let root = match run.latest_completed(&criterion.phase) {
                Some(execution) => {
                    let outputs = self
                        .load_outputs(
                            &run.id,
                            &execution.phase_id,
                            execution.iteration,
                            &execution.artifacts,
                        )
                        .await;
                    condition_root(&outputs)
                }
                None => Value::Null,
            };
            if !condition::evaluate(&criterion.condition, &root) {
                return Err(OrchestratorError::CriterionNotMet {
                    phase: criterion.phase.clone(),
                    condition: criterion.condition.clone(),
                });
            }
        }
        Ok(())
    }

    async fn cleanup(&self, run: &mut WorkflowRun) {
        let Some(workspace) = run.workspace_path.clone() else {
            return;
        };
        if run.workspace.mode == WorkspaceMode::InPlace || self.options.keep_workspace {
            return;
        }
        self.emit(self.event(&run.id, WorkflowEventType::CleanupStart).with_data(json!({
            "workspace": workspace,
        })))
        .await;
        match self
            .deps
            .workspaces
            .cleanup_workspace(&run.id, &run.workspace, &workspace)
            .await
        {
            Ok(()) => {
                self.emit(self.event(&run.id, WorkflowEventType::CleanupComplete))
                    .await
            }
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "workspace cleanup failed");
                self.emit(self.event(&run.id, WorkflowEventType::CleanupError).with_data(json!({
                    "error": format!("{:#}", e),
                })))
                .await;
            }
        }
    }

    fn event(&self, run_id: &str, event_type: WorkflowEventType) -> WorkflowEvent {
        WorkflowEvent::new(run_id, event_type, self.deps.clock.now_ms())
    }

    fn phase_event(
        &self,
        run: &WorkflowRun,
        scope: &PhaseScope<'_>,
        event_type: WorkflowEventType,
    ) -> WorkflowEvent {
        self.event(&run.id, event_type)
            .for_phase(&scope.phase.id, scope.iteration)
    }

    async fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.deps.persistence.log_workflow_event(&event).await {
            tracing::warn!(run_id = %event.run_id, event = %event.event_type, error = %e, "failed to log workflow event");
        }
    }

    async fn persist(&self, run: &mut WorkflowRun) {
        run.updated_at_ms = self.deps.clock.now_ms();
        if let Err(e) = self.deps.persistence.save_workflow_state(run).await {
            tracing::warn!(run_id = %run.id, error = %e, "failed to save workflow state");
        }
    }
}

fn missing(phase: &str, artifact: &str) -> AttemptError {
    AttemptError::Retry(
        OrchestratorError::ArtifactMissing {
            phase: phase.to_string(),
            artifact: artifact.to_string(),
        }
        .to_string(),
    )
}

fn is_json(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// The value conditions are evaluated against: the first output, with
/// every output also reachable under its file stem unless the first output
/// already uses that key.
fn condition_root(outputs: &[(String, Value)]) -> Value {
    let Some((_, first)) = outputs.first() else {
        return Value::Null;
    };
    let mut root = first.clone();
    if let Value::Object(map) = &mut root {
        for (name, value) in outputs {
            map.entry(file_stem(name)).or_insert_with(|| value.clone());
        }
    }
    root
}

fn check_max_tasks(outputs: &[(String, Value)], limit: u32) -> Result<(), OrchestratorError> {
    for (_, value) in outputs {
        if let Some(tasks) = value.get("tasks").and_then(Value::as_array) {
            let observed = tasks.len() as u32;
            if observed > limit {
                return Err(OrchestratorError::MaxTasksExceeded { limit, observed });
            }
        }
    }
    Ok(())
}

/// Deterministic stand-in output used when the run is not live.
fn stub_outputs(phase: &PhaseDefinition, task: &str) -> BTreeMap<String, String> {
    phase
        .output_artifacts
        .iter()
        .map(|name| {
            let content = if is_json(name) {
                let value = match phase.engine {
                    EngineRole::Planner => json!({
                        "summary": format!("Stub plan for: {}", task),
                        "tasks": [{ "id": 1, "description": task }],
                    }),
                    EngineRole::Executor => json!({
                        "summary": format!("Stub execution for: {}", task),
                        "files_changed": [],
                    }),
                    EngineRole::Reviewer => json!({
                        "approved": true,
                        "issues": [],
                    }),
                };
                serde_json::to_string_pretty(&value).unwrap_or_default()
            } else {
                format!("Stub {} output for phase {}\n", phase.engine, phase.id)
            };
            (name.clone(), content)
        })
        .collect()
}

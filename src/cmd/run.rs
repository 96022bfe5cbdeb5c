//! Start and drive one workflow run — `conductor run`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::RunArgs;
use super::prompt::ApprovalResolver;

/// Rate-limit key shared by every approval this process requests.
const APPROVAL_SESSION: &str = "cli";

pub async fn cmd_run(project_dir: &Path, args: &RunArgs) -> Result<()> {
    use conductor::approval::{
        ApprovalGate, ApprovalStore, CompositeApprovalStore, ExecApprovalPrompter,
    };
    use conductor::clock;
    use conductor::config::ConductorConfig;
    use conductor::runtime::{CommandAgentRunner, FsRunStore, LocalWorkspaceManager};
    use conductor::workflow::{
        Collaborators, OrchestratorOptions, RunStatus, WorkflowInput, WorkflowOrchestrator,
        WorkspaceConfig, WorkspaceMode,
    };

    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let registry = config.registry()?;
    let run_root = config.run_root();
    let live = args.live || config.live();
    let auto_approve = args.yes || config.toml.orchestrator.auto_approve;
    let mode: WorkspaceMode = args.workspace.parse()?;
    let repo = args
        .repo
        .clone()
        .unwrap_or_else(|| config.project_dir.clone());

    let clock = clock::system();
    let store = Arc::new(FsRunStore::new(run_root.clone()));
    let approvals: Arc<dyn ApprovalStore> = Arc::new(CompositeApprovalStore::new(&run_root));
    // Prompts go through the rate-limited exec approval queue; the resolver
    // answers them on the terminal or automatically.
    let exec_approvals = Arc::new(config.exec_approvals(clock.clone()));
    let resolver = if auto_approve {
        ApprovalResolver::Auto
    } else {
        ApprovalResolver::Terminal
    };
    let gate = Arc::new(ApprovalGate::new(
        approvals,
        Arc::new(ExecApprovalPrompter::new(exec_approvals.clone(), APPROVAL_SESSION)),
        clock.clone(),
        config.toml.orchestrator.approval_timeout_ms,
    ));
    let agent = &config.toml.agent;
    let orchestrator = WorkflowOrchestrator::new(
        registry,
        Collaborators {
            persistence: store.clone(),
            artifacts: store,
            workspaces: Arc::new(LocalWorkspaceManager::new(run_root.clone())),
            agent: Arc::new(CommandAgentRunner::new(agent.command.clone(), agent.args.clone())),
            gate,
            clock,
        },
        OrchestratorOptions {
            live,
            policy: config.policy().clone(),
            model: agent.model.clone(),
            provider: agent.provider.clone(),
            agent_timeout_ms: agent.timeout_ms,
            keep_workspace: args.keep_workspace,
        },
    );

    let run = orchestrator
        .start(
            &args.workflow,
            WorkflowInput::new(&args.task, &repo),
            WorkspaceConfig {
                mode,
                repo_path: repo.clone(),
            },
        )
        .await?;

    println!();
    println!(
        "{} {} ({})",
        console::style("Run").bold(),
        console::style(&run.id).cyan(),
        args.workflow
    );
    println!(
        "  Mode: {}, workspace: {}",
        if live { "live" } else { "stub" },
        mode
    );
    println!("  Runs: {}", run_root.display());
    println!();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let stop_resolver = CancellationToken::new();
    tokio::spawn(resolver.serve(exec_approvals.clone(), stop_resolver.clone()));

    let result = orchestrator.execute(&run.id, &cancel).await;
    stop_resolver.cancel();
    let rate_limited = exec_approvals
        .audit_log()
        .iter()
        .filter(|e| e.kind == conductor::approval::AuditKind::RateLimited)
        .count();
    // The terminal state is persisted either way.
    let finished = orchestrator.load(&run.id).await?;
    for phase in &finished.phase_history {
        let marker = match phase.status {
            conductor::workflow::PhaseStatus::Completed => console::style("✓").green(),
            conductor::workflow::PhaseStatus::Skipped => console::style("-").yellow(),
            conductor::workflow::PhaseStatus::Failed => console::style("✗").red(),
        };
        println!(
            "  {} {} (iteration {}, {} attempt(s))",
            marker, phase.phase_id, phase.iteration, phase.attempts
        );
    }
    if rate_limited > 0 {
        println!(
            "  {}",
            console::style(format!("{} approval request(s) rate limited", rate_limited)).yellow()
        );
    }
    println!();

    match result {
        Ok(run) => {
            println!(
                "{} in {} phase(s), {} agent run(s)",
                console::style("Completed").green().bold(),
                run.phase_history.len(),
                run.agent_run_count
            );
            if run.review_iterations_exhausted {
                println!(
                    "  {}",
                    console::style("Review iterations exhausted before approval").yellow()
                );
            }
            Ok(())
        }
        Err(e) => {
            let label = if finished.status == RunStatus::Aborted {
                console::style("Aborted").yellow().bold()
            } else {
                console::style("Failed").red().bold()
            };
            println!("{}: {}", label, e);
            Err(e.into())
        }
    }
}

//! Run inspection — `conductor status`, `conductor list`, `conductor approvals`.

use anyhow::{Result, bail};
use std::path::Path;

use conductor::config::ConductorConfig;
use conductor::runtime::{FsRunStore, WorkflowPersistence};

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn style_status(status: conductor::workflow::RunStatus) -> console::StyledObject<String> {
    use conductor::workflow::RunStatus;
    let text = status.to_string();
    match status {
        RunStatus::Completed => console::style(text).green(),
        RunStatus::Failed => console::style(text).red(),
        RunStatus::Aborted => console::style(text).yellow(),
        RunStatus::Pending | RunStatus::Running => console::style(text).cyan(),
    }
}

pub async fn cmd_status(project_dir: &Path, run_id: &str) -> Result<()> {
    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let store = FsRunStore::new(config.run_root());
    let Some(run) = store.load_workflow_state(run_id).await? else {
        bail!("Run {} not found under {}", run_id, store.root().display());
    };

    println!();
    println!("Run {}", console::style(&run.id).bold());
    println!("  Workflow:   {}", run.workflow_type);
    println!("  Status:     {}", style_status(run.status));
    println!("  Task:       {}", run.input.task);
    println!("  Mode:       {}", if run.live { "live" } else { "stub" });
    println!("  Workspace:  {} ({})", run.workspace.repo_path.display(), run.workspace.mode);
    println!("  Started:    {}", format_time(run.started_at_ms));
    if let Some(end) = run.finished_at_ms {
        println!("  Finished:   {} ({}ms)", format_time(end), end - run.started_at_ms);
    }
    println!(
        "  Agent runs: {}   Approvals: {}   Review iterations: {}{}",
        run.agent_run_count,
        run.approval_count,
        run.review_iterations,
        if run.review_iterations_exhausted {
            " (exhausted)"
        } else {
            ""
        }
    );
    if let Some(error) = &run.error {
        println!("  Error:      {}", console::style(error).red());
    }
    println!();

    if run.phase_history.is_empty() {
        println!("No phases executed.");
    } else {
        println!(
            "{:<16} {:<10} {:<6} {:<9} {:<10} Artifacts",
            "Phase", "Engine", "Iter", "Attempts", "Status"
        );
        for phase in &run.phase_history {
            println!(
                "{:<16} {:<10} {:<6} {:<9} {:<10} {}",
                phase.phase_id,
                phase.engine,
                phase.iteration,
                phase.attempts,
                phase.status,
                phase.artifacts.join(", ")
            );
            if let Some(error) = &phase.error {
                println!("  {}", console::style(error).dim());
            }
        }
    }

    let events = store.read_events(run_id).await?;
    println!();
    println!("{} event(s) in {}", events.len(), store.run_dir(run_id)?.display());
    println!();
    Ok(())
}

pub async fn cmd_list(project_dir: &Path) -> Result<()> {
    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let store = FsRunStore::new(config.run_root());
    let runs = store.list_runs().await?;

    println!();
    if runs.is_empty() {
        println!("No runs found. Start one with 'conductor run --task <text>'.");
        println!();
        return Ok(());
    }

    println!(
        "{:<38} {:<22} {:<10} {:<20} Task",
        "Run", "Workflow", "Status", "Started"
    );
    for run in &runs {
        println!(
            "{:<38} {:<22} {:<10} {:<20} {}",
            run.id,
            run.workflow_type,
            style_status(run.status),
            format_time(run.started_at_ms),
            run.task
        );
    }
    println!();
    println!("{} run(s)", runs.len());
    println!();
    Ok(())
}

pub fn cmd_approvals(project_dir: &Path, run_id: &str) -> Result<()> {
    use conductor::approval::{ApprovalDecision, ApprovalStore, FileApprovalStore};

    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let store = FileApprovalStore::new(&config.run_root());
    let records = store.list_for_run(run_id)?;

    println!();
    if records.is_empty() {
        println!("No approvals recorded for run {}.", run_id);
        println!();
        return Ok(());
    }

    for record in &records {
        let decision = match record.decision {
            ApprovalDecision::Approved => console::style(record.decision.to_string()).green(),
            ApprovalDecision::Denied => console::style(record.decision.to_string()).red(),
            ApprovalDecision::Timeout => console::style(record.decision.to_string()).yellow(),
        };
        println!(
            "{} {} {} on {} [{}]{}",
            format_time(record.decided_at_ms),
            decision,
            record.request.action.action_type,
            record.request.action.describe_target(),
            record.request.phase_id,
            if record.remember { " (remembered)" } else { "" }
        );
        println!("  {}", console::style(&record.request.reason).dim());
        if let Some(comment) = &record.comment {
            println!("  comment: {}", comment);
        }
    }
    println!();
    Ok(())
}

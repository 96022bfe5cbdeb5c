//! Answers pending shell approvals for `conductor run`, on the terminal or
//! automatically with `--yes`.

use anyhow::{Context, Result};
use conductor::approval::{ExecApprovalManager, ExecApprovalRecord, ExecDecision};
use dialoguer::{Select, theme::ColorfulTheme};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResolver {
    /// Allow every request once
    Auto,
    /// Ask on the terminal; deny when none is attached
    Terminal,
}

fn ask(record: &ExecApprovalRecord) -> Result<ExecDecision> {
    let request = &record.request;
    println!();
    println!(
        "  {} {}",
        console::style("Approval needed:").yellow().bold(),
        console::style(&request.command).bold()
    );
    if let Some(phase) = &request.agent_id {
        println!("  Phase: {}", phase);
    }
    if let Some(cwd) = &request.cwd {
        println!("  In:    {}", console::style(cwd.display()).dim());
    }

    let options = &["Allow once", "Allow for this run", "Deny"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Allow this action?")
        .items(options)
        .default(0)
        .interact()?;
    Ok(match selection {
        0 => ExecDecision::AllowOnce,
        1 => ExecDecision::AllowAlways,
        _ => ExecDecision::Deny,
    })
}

impl ApprovalResolver {
    async fn decide(self, record: &ExecApprovalRecord) -> (ExecDecision, &'static str) {
        match self {
            ApprovalResolver::Auto => (ExecDecision::AllowOnce, "auto-approve"),
            ApprovalResolver::Terminal if !console::user_attended() => {
                tracing::warn!(
                    request_id = %record.id,
                    "no terminal attached to answer the approval prompt (use --yes to auto-approve)"
                );
                (ExecDecision::Deny, "no-terminal")
            }
            ApprovalResolver::Terminal => {
                let pending = record.clone();
                let answer = tokio::task::spawn_blocking(move || ask(&pending))
                    .await
                    .context("Approval prompt panicked")
                    .and_then(|answer| answer);
                match answer {
                    Ok(decision) => (decision, "terminal"),
                    Err(e) => {
                        tracing::warn!(request_id = %record.id, error = %e, "approval prompt failed, denying");
                        (ExecDecision::Deny, "terminal")
                    }
                }
            }
        }
    }

    /// Resolve requests as the manager publishes them, until `stop` fires.
    pub async fn serve(self, manager: Arc<ExecApprovalManager>, stop: CancellationToken) {
        while let Some(record) = manager.next_pending(&stop).await {
            let decision = tokio::select! {
                decision = self.decide(&record) => decision,
                _ = stop.cancelled() => return,
            };
            let (decision, by) = decision;
            if !manager.resolve(&record.id, decision, Some(by)) {
                tracing::debug!(request_id = %record.id, "approval already expired");
            }
        }
    }
}

//! Policy evaluation from the command line — `conductor policy check`.

use anyhow::Result;
use std::path::Path;

use conductor::config::ConductorConfig;
use conductor::policy::{
    ActionType, Decision, PolicyContext, PolicyEngine, derive_exec_overrides,
};

pub fn cmd_policy_check(
    project_dir: &Path,
    action: &str,
    path: Option<&Path>,
    command: Option<&str>,
    url: Option<&str>,
) -> Result<()> {
    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let engine = PolicyEngine::new(config.policy().clone())?;
    let action: ActionType = action.parse()?;

    let mut ctx = PolicyContext::action(action).in_workspace(&config.project_dir);
    if let Some(path) = path {
        ctx.target_path = Some(path.to_path_buf());
    }
    if let Some(command) = command {
        ctx.command = Some(command.to_string());
    }
    if let Some(url) = url {
        ctx.url = Some(url.to_string());
    }

    let result = engine.authorize(&ctx);
    let decision = match &result.decision {
        Decision::Allow => console::style("allow").green().bold(),
        Decision::Deny(_) => console::style("deny").red().bold(),
        Decision::Prompt(_) => console::style("prompt").yellow().bold(),
    };

    println!();
    println!("{} {} → {}", action, ctx.describe_target(), decision);
    println!("  Reason: {}", result.reason());
    if let Some(rule) = &result.rule_id {
        println!("  Rule:   {}", rule);
    }
    if result.destructive_override {
        println!("  {}", console::style("Destructive action: approval required").dim());
    }

    let exec = derive_exec_overrides(&engine);
    println!();
    println!(
        "Exec overrides: security={:?} ask={:?} shell={} network={}",
        exec.security, exec.ask, exec.shell_allowed, exec.network_allowed
    );
    println!();
    Ok(())
}

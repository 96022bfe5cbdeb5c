//! Workflow definition listing — `conductor workflows`.

use anyhow::Result;
use std::path::Path;

use conductor::config::ConductorConfig;

pub fn cmd_workflows(project_dir: &Path) -> Result<()> {
    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let registry = config.registry()?;

    println!();
    for definition in registry.list() {
        println!("{}", console::style(&definition.workflow_type).bold());
        if !definition.description.is_empty() {
            println!("  {}", definition.description);
        }
        let s = &definition.settings;
        println!(
            "  maxDurationMs={} maxAgentRuns={} maxReviewIterations={} maxTasks={}",
            s.max_duration_ms, s.max_agent_runs, s.max_review_iterations, s.max_tasks
        );
        for phase in &definition.phases {
            let mut line = format!("    {:<12} {:<9}", phase.id, phase.engine);
            if !phase.input_artifacts.is_empty() {
                line.push_str(&format!(" in: {}", phase.input_artifacts.join(", ")));
            }
            if !phase.output_artifacts.is_empty() {
                line.push_str(&format!(" out: {}", phase.output_artifacts.join(", ")));
            }
            if let Some(repeat) = &phase.repeat {
                line.push_str(&format!(
                    " repeat while {} → {}",
                    repeat.condition,
                    repeat.goto.as_deref().unwrap_or(&phase.id)
                ));
            }
            println!("{}", line);
        }
        println!();
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Multi-phase agent workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow run and drive it to completion
    Run(RunArgs),
    /// Show one run's status and phase history
    Status { run_id: String },
    /// List recorded runs, newest first
    List,
    /// Show the approval log of a run
    Approvals { run_id: String },
    /// Inspect the configured policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// List registered workflow definitions
    Workflows,
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Workflow type to run
    #[arg(short, long, default_value = conductor::workflow::PLAN_EXECUTE_REVIEW)]
    pub workflow: String,

    /// Task description handed to every phase
    #[arg(short, long)]
    pub task: String,

    /// Target repository (defaults to the project directory)
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// Workspace mode: in-place, worktree, copy
    #[arg(long, default_value = "in-place")]
    pub workspace: String,

    /// Invoke the configured agent instead of stub output
    #[arg(long)]
    pub live: bool,

    /// Approve every prompt without asking
    #[arg(long)]
    pub yes: bool,

    /// Keep worktree/copy workspaces after the run
    #[arg(long)]
    pub keep_workspace: bool,
}

#[derive(Subcommand, Clone)]
pub enum PolicyCommands {
    /// Evaluate one action against the policy
    Check {
        /// Action type, e.g. file_write or bash_execute
        #[arg(long)]
        action: String,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    conductor::logging::init(cli.verbose, cli.log_json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&project_dir, args).await?,
        Commands::Status { run_id } => cmd::cmd_status(&project_dir, run_id).await?,
        Commands::List => cmd::cmd_list(&project_dir).await?,
        Commands::Approvals { run_id } => cmd::cmd_approvals(&project_dir, run_id)?,
        Commands::Policy { command } => match command {
            PolicyCommands::Check {
                action,
                path,
                command,
                url,
            } => cmd::cmd_policy_check(
                &project_dir,
                action,
                path.as_deref(),
                command.as_deref(),
                url.as_deref(),
            )?,
        },
        Commands::Workflows => cmd::cmd_workflows(&project_dir)?,
    }

    Ok(())
}

use crate::policy::{ExecAsk, ExecSecurity};
use crate::runtime::{AgentMetrics, AgentRequest, AgentResponse, AgentRunner};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub const ARTIFACTS_DIR_ENV: &str = "CONDUCTOR_ARTIFACTS_DIR";

/// Runs an external agent command once per phase attempt.
///
/// The prompt is written to stdin, stdout becomes the output. The run
/// context is exported through `CONDUCTOR_*` environment variables, and the
/// child is killed on timeout or cancellation.
#[derive(Debug, Clone)]
pub struct CommandAgentRunner {
    command: String,
    args: Vec<String>,
}

impl CommandAgentRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn build_command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .current_dir(&request.workspace_path)
            .env("CONDUCTOR_SESSION_ID", &request.session_id)
            .env("CONDUCTOR_PHASE", &request.phase_id)
            .env("CONDUCTOR_ENGINE", request.engine.as_str())
            .env("CONDUCTOR_ITERATION", request.iteration.to_string())
            .env("CONDUCTOR_EXEC_SECURITY", security_str(request.exec.security))
            .env("CONDUCTOR_EXEC_ASK", ask_str(request.exec.ask))
            .env(
                "CONDUCTOR_SHELL_ALLOWED",
                request.exec.shell_allowed.to_string(),
            )
            .env(
                "CONDUCTOR_NETWORK_ALLOWED",
                request.exec.network_allowed.to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.artifacts_dir {
            cmd.env(ARTIFACTS_DIR_ENV, dir);
        }
        if let Some(model) = &request.model {
            cmd.env("CONDUCTOR_MODEL", model);
        }
        if let Some(provider) = &request.provider {
            cmd.env("CONDUCTOR_PROVIDER", provider);
        }
        cmd
    }
}

fn security_str(security: ExecSecurity) -> &'static str {
    match security {
        ExecSecurity::Deny => "deny",
        ExecSecurity::Allowlist => "allowlist",
        ExecSecurity::Full => "full",
    }
}

fn ask_str(ask: ExecAsk) -> &'static str {
    match ask {
        ExecAsk::Off => "off",
        ExecAsk::Always => "always",
    }
}

#[async_trait]
impl AgentRunner for CommandAgentRunner {
    async fn run(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentResponse> {
        if let Some(dir) = &request.artifacts_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let start = Instant::now();
        let mut child = self
            .build_command(&request)
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{}'", self.command))?;
        tracing::debug!(
            command = %self.command,
            pid = child.id().unwrap_or(0),
            phase = %request.phase_id,
            "agent process spawned"
        );

        // Write prompt to stdin and close it
        // An agent that exits without reading stdin is reported through its exit status.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                tracing::debug!(error = %e, "agent closed stdin before reading the prompt");
            }
            let _ = stdin.shutdown().await;
        }

        let mut stdout = child.stdout.take().context("Failed to get stdout")?;
        let mut stderr = child.stderr.take().context("Failed to get stderr")?;
        let collect = async {
            let mut out = String::new();
            let mut err = String::new();
            let (a, b) = tokio::join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err));
            a?;
            b?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let timeout = Duration::from_millis(request.timeout_ms);
        let (status, output, stderr_text) = tokio::select! {
            finished = collect => finished.context("Failed to collect agent output")?,
            _ = tokio::time::sleep(timeout) => {
                anyhow::bail!("agent timed out after {}ms", request.timeout_ms);
            }
            _ = cancel.cancelled() => {
                anyhow::bail!("agent cancelled");
            }
        };

        let metrics = AgentMetrics {
            duration_ms: start.elapsed().as_millis() as u64,
            exit_code: status.code(),
            output_chars: output.len(),
        };
        tracing::debug!(exit_code = ?metrics.exit_code, duration_ms = metrics.duration_ms, "agent process finished");

        if status.success() {
            Ok(AgentResponse {
                success: true,
                output,
                metrics,
                ..AgentResponse::default()
            })
        } else {
            let detail = stderr_text.trim();
            Ok(AgentResponse {
                success: false,
                error: Some(format!(
                    "agent exited with {}{}",
                    status
                        .code()
                        .map(|c| format!("code {}", c))
                        .unwrap_or_else(|| "a signal".to_string()),
                    if detail.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", detail)
                    }
                )),
                output,
                metrics,
                ..AgentResponse::default()
            })
        }
    }
}

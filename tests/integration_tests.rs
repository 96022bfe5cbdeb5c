//! Integration tests for the conductor CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A conductor command isolated to `dir`: no user-level config, no
/// inherited overrides.
fn conductor(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.current_dir(dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join(".xdg"))
        .env_remove("CONDUCTOR_LIVE")
        .env_remove("CONDUCTOR_RUN_ROOT")
        .env_remove("CONDUCTOR_AGENT_CMD")
        .env_remove("CONDUCTOR_LOG")
        .env_remove("RUST_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn write_config(dir: &TempDir, content: &str) {
    let config_dir = dir.path().join(".conductor");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("conductor.toml"), content).unwrap();
}

/// Run ids recorded under the default run root.
fn run_ids(dir: &TempDir) -> Vec<String> {
    let runs = dir.path().join(".conductor/runs");
    let Ok(entries) = fs::read_dir(runs) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_conductor_help() {
        let dir = create_temp_project();
        conductor(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("workflow"));
    }

    #[test]
    fn test_conductor_version() {
        let dir = create_temp_project();
        conductor(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_task() {
        let dir = create_temp_project();
        conductor(&dir).arg("run").assert().failure();
    }
}

// =============================================================================
// Workflow Definitions
// =============================================================================

mod workflows {
    use super::*;

    #[test]
    fn test_lists_builtin_workflow() {
        let dir = create_temp_project();
        conductor(&dir)
            .arg("workflows")
            .assert()
            .success()
            .stdout(predicate::str::contains("plan-execute-review"))
            .stdout(predicate::str::contains("review"))
            .stdout(predicate::str::contains("repeat while $.approved == false"));
    }

    #[test]
    fn test_lists_configured_workflow() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
[[workflows]]
type = "plan-only"

[[workflows.phases]]
id = "plan"
engine = "planner"
output_artifacts = ["plan.json"]
"#,
        );
        conductor(&dir)
            .arg("workflows")
            .assert()
            .success()
            .stdout(predicate::str::contains("plan-only"))
            .stdout(predicate::str::contains("plan-execute-review"));
    }

    #[test]
    fn test_invalid_configured_workflow_fails() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
[[workflows]]
type = "broken"

[[workflows.phases]]
id = "review"
engine = "reviewer"
input_artifacts = ["changes.json"]
"#,
        );
        conductor(&dir)
            .arg("workflows")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid workflow"));
    }
}

// =============================================================================
// Policy
// =============================================================================

mod policy {
    use super::*;

    #[test]
    fn test_default_policy_allows_shell() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["policy", "check", "--action", "bash_execute", "--command", "cargo test"])
            .assert()
            .success()
            .stdout(predicate::str::contains("allow"))
            .stdout(predicate::str::contains("security=Full"));
    }

    #[test]
    fn test_destructive_action_needs_approval() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["policy", "check", "--action", "git_push"])
            .assert()
            .success()
            .stdout(predicate::str::contains("prompt"))
            .stdout(predicate::str::contains("Destructive action"));
    }

    #[test]
    fn test_configured_deny_rule_wins() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
[policy]
default_decision = "allow"

[[policy.rules]]
id = "no-curl"
actions = ["bash_execute"]
decision = "deny"
command_patterns = ["curl *"]
"#,
        );
        conductor(&dir)
            .args([
                "policy",
                "check",
                "--action",
                "bash_execute",
                "--command",
                "curl https://example.com",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("deny"))
            .stdout(predicate::str::contains("no-curl"));
    }

    #[test]
    fn test_path_outside_workspace_is_denied() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["policy", "check", "--action", "file_write", "--path", "/etc/passwd"])
            .assert()
            .success()
            .stdout(predicate::str::contains("deny"));
    }

    #[test]
    fn test_unknown_action_fails() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["policy", "check", "--action", "launch_rockets"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid action type"));
    }
}

// =============================================================================
// Runs
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_list_without_runs() {
        let dir = create_temp_project();
        conductor(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs found"));
    }

    #[test]
    fn test_status_of_unknown_run_fails() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["status", "does-not-exist"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_stub_run_completes_and_is_listed() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["run", "--task", "add request logging", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Completed"))
            .stdout(predicate::str::contains("plan"))
            .stdout(predicate::str::contains("stub"));

        let ids = run_ids(&dir);
        assert_eq!(ids.len(), 1);
        let run_dir = dir.path().join(".conductor/runs").join(&ids[0]);
        assert!(run_dir.join("run.json").exists());
        assert!(run_dir.join("events.jsonl").exists());

        conductor(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains(ids[0].as_str()))
            .stdout(predicate::str::contains("completed"));

        conductor(&dir)
            .args(["status", ids[0].as_str()])
            .assert()
            .success()
            .stdout(predicate::str::contains("add request logging"))
            .stdout(predicate::str::contains("review"));
    }

    #[test]
    fn test_copy_workspace_run_leaves_repo_untouched() {
        let dir = create_temp_project();
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        conductor(&dir)
            .args(["run", "--task", "tidy", "--workspace", "copy", "--yes"])
            .assert()
            .success();

        let ids = run_ids(&dir);
        assert_eq!(ids.len(), 1);
        // Copy workspaces are removed after the run.
        assert!(
            !dir.path()
                .join(".conductor/runs")
                .join(&ids[0])
                .join("workspace")
                .exists()
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn test_unknown_workspace_mode_fails() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["run", "--task", "x", "--workspace", "sandbox"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid workspace mode"));
    }

    #[test]
    fn test_unknown_workflow_fails() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["run", "--task", "x", "--workflow", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not registered"));
    }

    #[test]
    fn test_denied_run_is_recorded_as_failed() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
[[policy.rules]]
id = "read-only"
actions = ["file_write"]
decision = "deny"
"#,
        );
        conductor(&dir)
            .args(["run", "--task", "x", "--yes"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Failed"));

        conductor(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"));
    }

    #[test]
    fn test_approvals_for_run_without_prompts() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["approvals", "some-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No approvals recorded"));
    }

    const ASK_READS: &str = r#"
[[policy.rules]]
id = "ask-reads"
actions = ["file_read"]
decision = "prompt"
"#;

    #[test]
    fn test_yes_answers_prompts_through_approval_queue() {
        let dir = create_temp_project();
        write_config(&dir, ASK_READS);
        conductor(&dir)
            .args(["run", "--task", "x", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Completed"))
            .stdout(predicate::str::contains("rate limited").not());

        let ids = run_ids(&dir);
        conductor(&dir)
            .args(["approvals", ids[0].as_str()])
            .assert()
            .success()
            .stdout(predicate::str::contains("approved"))
            .stdout(predicate::str::contains("file_read"));
    }

    #[test]
    fn test_rate_limited_approvals_fail_run() {
        let dir = create_temp_project();
        write_config(
            &dir,
            &format!("[rate_limit]\nmax_per_window = 1\n{}", ASK_READS),
        );
        conductor(&dir)
            .args(["run", "--task", "x", "--yes"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("1 approval request(s) rate limited"))
            .stdout(predicate::str::contains("Failed"));

        let ids = run_ids(&dir);
        assert_eq!(ids.len(), 1);
        conductor(&dir)
            .args(["approvals", ids[0].as_str()])
            .assert()
            .success()
            .stdout(predicate::str::contains("comment: rate limited"));
    }

    #[test]
    fn test_prompt_without_terminal_is_denied() {
        let dir = create_temp_project();
        write_config(&dir, ASK_READS);
        conductor(&dir)
            .args(["run", "--task", "x"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Failed"));

        let ids = run_ids(&dir);
        conductor(&dir)
            .args(["approvals", ids[0].as_str()])
            .assert()
            .success()
            .stdout(predicate::str::contains("denied"));
    }

    #[test]
    fn test_status_rejects_escaping_run_id() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["status", "../outside"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid run id"));
    }
}

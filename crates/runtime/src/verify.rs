//! Post-turn verification and diff capture.
//!
//! In implementation mode the configured verification commands run
//! after each completed turn; the first failure becomes the turn's
//! verification-failure string for the stall detector. The per-turn
//! diff artifact is a best-effort `git diff` of the working directory
//! (empty when the directory is not a repository).

use std::path::PathBuf;

use ag_domain::config::ExecConfig;
use ag_tools::{run_command, CommandRequest, CommandSecurity};

/// Seconds allotted to the diff capture; it must never stall a turn.
const DIFF_TIMEOUT_SEC: u64 = 10;

/// Run the verification commands in order; returns a description of
/// the first failure, or `None` when everything passes.
pub async fn run_verification(
    commands: &[String],
    working_dir: &PathBuf,
    config: &ExecConfig,
    security: &CommandSecurity,
) -> Option<String> {
    for command in commands {
        let outcome = run_command(
            working_dir,
            CommandRequest {
                cmd: command.clone(),
                workdir: None,
                env: None,
                timeout_sec: None,
            },
            config,
            security,
        )
        .await;

        if !outcome.ok() {
            let code = outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| format!("{:?}", outcome.status).to_lowercase());
            tracing::debug!(command = %command, code = %code, "verification command failed");
            return Some(format!("{command} (exit {code})"));
        }
    }
    None
}

/// Capture the working tree diff, best-effort.
pub async fn capture_diff(working_dir: &PathBuf, config: &ExecConfig) -> String {
    let outcome = run_command(
        working_dir,
        CommandRequest {
            cmd: "git diff".into(),
            workdir: None,
            env: None,
            timeout_sec: Some(DIFF_TIMEOUT_SEC),
        },
        config,
        &CommandSecurity::empty(),
    )
    .await;

    if outcome.ok() {
        outcome.output
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExecConfig {
        ExecConfig::default()
    }

    #[tokio::test]
    async fn passing_commands_yield_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_verification(
            &["true".into(), "echo ok".into()],
            &dir.path().to_path_buf(),
            &config(),
            &CommandSecurity::empty(),
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn first_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_verification(
            &["true".into(), "exit 2".into(), "exit 3".into()],
            &dir.path().to_path_buf(),
            &config(),
            &CommandSecurity::empty(),
        )
        .await;
        assert_eq!(result.as_deref(), Some("exit 2 (exit 2)"));
    }

    #[tokio::test]
    async fn empty_command_list_passes() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_verification(
            &[],
            &dir.path().to_path_buf(),
            &config(),
            &CommandSecurity::empty(),
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn diff_outside_a_repo_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let diff = capture_diff(&dir.path().to_path_buf(), &config()).await;
        assert!(diff.is_empty());
    }
}

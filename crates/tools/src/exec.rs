//! The `command` tool — run a shell command in the run's working
//! directory with a hard timeout.
//!
//! Security screens run before the process spawns: commands matching a
//! configured denied-pattern regex are rejected, and environment
//! overrides that can hijack process loading (`LD_PRELOAD`, `PATH`, …)
//! are blocked.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use ag_domain::config::ExecConfig;
use ag_domain::error::{Error, Result};

use crate::output::OutputBuffer;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub cmd: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    /// Override the configured timeout (seconds).
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Finished,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Interleaved stdout + stderr, bounded by `maxOutputChars`.
    pub output: String,
}

impl CommandOutcome {
    pub fn ok(&self) -> bool {
        self.status == CommandStatus::Finished && self.exit_code == Some(0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Security screens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pre-compiled screens shared across every `command` call.
pub struct CommandSecurity {
    denied: RegexSet,
}

impl CommandSecurity {
    pub fn from_config(config: &ExecConfig) -> Result<Self> {
        let denied = RegexSet::new(&config.denied_patterns)
            .map_err(|e| Error::Config(format!("invalid denied pattern: {e}")))?;
        Ok(Self { denied })
    }

    pub fn empty() -> Self {
        Self {
            denied: RegexSet::empty(),
        }
    }

    pub fn is_denied(&self, cmd: &str) -> bool {
        self.denied.is_match(cmd)
    }
}

/// Environment variable names that must not be overridden by tool args.
fn is_blocked_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "LD_AUDIT",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
        "PATH",
        "HOME",
        "SHELL",
        "PYTHONPATH",
        "PYTHONSTARTUP",
        "NODE_OPTIONS",
        "BASH_ENV",
        "ENV",
        "IFS",
    ];
    let upper = name.to_ascii_uppercase();
    BLOCKED.contains(&upper.as_str())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a command to completion (or timeout) and capture its output.
///
/// The command runs under `sh -c` with `working_dir` as the default
/// cwd (a request-level `workdir` must be a subpath and wins). On
/// timeout the child is killed and the partial output retained.
pub async fn run_command(
    working_dir: &PathBuf,
    req: CommandRequest,
    config: &ExecConfig,
    security: &CommandSecurity,
) -> CommandOutcome {
    if security.is_denied(&req.cmd) {
        tracing::warn!(cmd = %req.cmd, "command rejected by denied-pattern screen");
        return CommandOutcome {
            status: CommandStatus::Failed,
            exit_code: None,
            output: "command rejected by security policy".into(),
        };
    }

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&req.cmd);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    match &req.workdir {
        Some(sub) => cmd.current_dir(working_dir.join(sub)),
        None => cmd.current_dir(working_dir),
    };

    if let Some(env) = &req.env {
        for (key, value) in env {
            if is_blocked_env_var(key) {
                return CommandOutcome {
                    status: CommandStatus::Failed,
                    exit_code: None,
                    output: format!("environment variable '{key}' is blocked by security policy"),
                };
            }
            cmd.env(key, value);
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome {
                status: CommandStatus::Failed,
                exit_code: None,
                output: format!("failed to spawn: {e}"),
            };
        }
    };

    // Dedicated reader tasks; stdout and stderr interleave into one
    // bounded buffer.
    let buffer = std::sync::Arc::new(parking_lot::Mutex::new(OutputBuffer::new(
        config.max_output_chars,
    )));

    let stdout_task = child.stdout.take().map(|stdout| {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.lock().push_line(&line);
            }
        })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.lock().push_line(&line);
            }
        })
    });

    let timeout = Duration::from_secs(req.timeout_sec.unwrap_or(config.timeout_sec));
    let (status, exit_code) = tokio::select! {
        result = child.wait() => match result {
            Ok(exit) => (CommandStatus::Finished, exit.code()),
            Err(e) => {
                buffer.lock().push_line(&format!("[process error: {e}]"));
                (CommandStatus::Failed, None)
            }
        },
        _ = tokio::time::sleep(timeout) => {
            tracing::debug!(cmd = %req.cmd, timeout_sec = timeout.as_secs(), "command timed out; killing child");
            let _ = child.kill().await;
            buffer.lock().push_line("[timed out]");
            (CommandStatus::TimedOut, None)
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let output = std::mem::replace(&mut *buffer.lock(), OutputBuffer::new(0)).into_string();
    CommandOutcome {
        status,
        exit_code,
        output,
    }
}

//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file
//! is a valid configuration. Keys are camelCase on the wire
//! (`dataDir`, `stallDetection`, …).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::run::{GlobalMode, OrchestrationMode};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub stall_detection: StallDetectionConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Registered providers (key = provider name referenced by nodes).
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            data_dir: d_data_dir(),
            workspace: WorkspaceConfig::default(),
            scheduler: SchedulerConfig::default(),
            orchestration: OrchestrationConfig::default(),
            planning: PlanningConfig::default(),
            verification: VerificationConfig::default(),
            stall_detection: StallDetectionConfig::default(),
            tools: ToolsConfig::default(),
            providers: HashMap::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: d_port() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How run working directories relate to the user's repository.
/// The runtime records the mode; `copy`/`worktree` materialization is
/// performed by the external workspace manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    #[default]
    Shared,
    Copy,
    Worktree,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub mode: WorkspaceMode,
    #[serde(default = "d_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub cleanup_on_done: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            mode: WorkspaceMode::Shared,
            root_dir: d_root_dir(),
            cleanup_on_done: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler + orchestration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Maximum concurrent active turns per run.
    #[serde(default = "d_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: d_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationConfig {
    /// Total turn budget across a run in auto mode. Hitting it
    /// completes the run.
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    /// Per-node turn budget. 0 = unlimited.
    #[serde(default = "d_max_turns_per_node")]
    pub max_turns_per_node: u32,
    /// Mode assigned to runs created without an explicit mode.
    #[serde(default)]
    pub default_run_mode: OrchestrationMode,
    /// Global mode assigned to runs created without an explicit one.
    /// The documented default is `implementation`.
    #[serde(default)]
    pub default_global_mode: GlobalMode,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_iterations: d_max_iterations(),
            max_turns_per_node: d_max_turns_per_node(),
            default_run_mode: OrchestrationMode::Interactive,
            default_global_mode: GlobalMode::Implementation,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planning + verification + stall detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningConfig {
    /// Where planning-mode nodes are allowed to write documents.
    #[serde(default = "d_docs_dir")]
    pub docs_directory: PathBuf,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            docs_directory: d_docs_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VerificationConfig {
    /// Shell commands run after each completed turn in implementation
    /// mode; the first failure feeds the stall detector.
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StallDetectionConfig {
    /// Consecutive identical outputs/diffs/failures before the run is
    /// paused. Minimum 2.
    #[serde(default = "d_stall_threshold")]
    pub threshold: u32,
}

impl Default for StallDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: d_stall_threshold(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    #[serde(default)]
    pub exec: ExecConfig,
    /// Seconds before an unresolved approval is auto-denied.
    /// Absent = approvals wait forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    /// Hard wall-clock limit for one `command` tool call.
    #[serde(default = "d_exec_timeout")]
    pub timeout_sec: u64,
    /// Ring-buffer cap for captured command output.
    #[serde(default = "d_max_output_chars")]
    pub max_output_chars: usize,
    /// Regexes rejected before execution (e.g. `rm\s+-rf\s+/`).
    #[serde(default)]
    pub denied_patterns: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_sec: d_exec_timeout(),
            max_output_chars: d_max_output_chars(),
            denied_patterns: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTransport {
    /// External CLI program supervised as a child process.
    #[default]
    Cli,
    /// HTTP request/response with SSE streaming.
    Api,
    /// In-process scripted adapter (tests, demos).
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProviderProtocol {
    /// Raw text lines on stdout.
    #[serde(rename = "text")]
    Text,
    /// One JSON event per stdout line.
    #[default]
    #[serde(rename = "stream-json")]
    StreamJson,
}

/// The superset of options any adapter may consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub transport: ProviderTransport,
    /// CLI executable. Required for `transport = "cli"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub protocol: ProviderProtocol,
    /// Appended (with the session id) on turns after the first when the
    /// provider supports argument-based resume. Empty = no resume.
    #[serde(default)]
    pub resume_args: Vec<String>,
    /// Transcript pairs replayed into the prompt when no resume
    /// mechanism exists.
    #[serde(default = "d_replay_turns")]
    pub replay_turns: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// True = one long-lived process fed prompts over stdin;
    /// false = spawn per turn.
    #[serde(default)]
    pub stateful_streaming: bool,
    /// Provider reports structured tool calls in its final message.
    #[serde(default)]
    pub native_tools: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            transport: ProviderTransport::default(),
            command: None,
            args: Vec::new(),
            protocol: ProviderProtocol::default(),
            resume_args: Vec::new(),
            replay_turns: d_replay_turns(),
            api_key: None,
            api_base_url: None,
            model: None,
            max_tokens: None,
            stateful_streaming: false,
            native_tools: false,
        }
    }
}

impl ProviderConfig {
    /// Stateless protocols cannot resume provider-side; resume is only
    /// meaningful for stateful sessions or argument-based continuation.
    pub fn supports_resume(&self) -> bool {
        match self.transport {
            ProviderTransport::Cli => self.stateful_streaming || !self.resume_args.is_empty(),
            ProviderTransport::Api => false,
            ProviderTransport::Mock => self.stateful_streaming,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    /// Empty = everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        fn error(issues: &mut Vec<ConfigIssue>, field: &str, message: String) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        }

        if self.server.port == 0 {
            error(&mut issues, "server.port", "port must be greater than 0".into());
        }
        if self.scheduler.max_concurrency < 1 {
            error(&mut issues, "scheduler.maxConcurrency", "must be at least 1".into());
        }
        if self.orchestration.max_iterations < 1 {
            error(&mut issues, "orchestration.maxIterations", "must be at least 1".into());
        }
        if self.stall_detection.threshold < 2 {
            error(&mut issues, "stallDetection.threshold", "must be at least 2".into());
        }
        if self.tools.exec.timeout_sec == 0 {
            error(&mut issues, "tools.exec.timeoutSec", "must be greater than 0".into());
        }

        for (i, pattern) in self.tools.exec.denied_patterns.iter().enumerate() {
            if let Err(e) = regex::Regex::new(pattern) {
                error(
                    &mut issues,
                    &format!("tools.exec.deniedPatterns[{i}]"),
                    format!("invalid regex: {e}"),
                );
            }
        }

        for (name, provider) in &self.providers {
            match provider.transport {
                ProviderTransport::Cli => {
                    if provider.command.as_deref().unwrap_or("").is_empty() {
                        error(
                            &mut issues,
                            &format!("providers.{name}.command"),
                            "cli transport requires a command".into(),
                        );
                    }
                }
                ProviderTransport::Api => {
                    if provider.api_base_url.as_deref().unwrap_or("").is_empty() {
                        error(
                            &mut issues,
                            &format!("providers.{name}.apiBaseUrl"),
                            "api transport requires a base URL".into(),
                        );
                    }
                    if provider.api_key.is_none() {
                        issues.push(ConfigIssue {
                            severity: ConfigSeverity::Warning,
                            field: format!("providers.{name}.apiKey"),
                            message: "no API key configured; requests may be rejected".into(),
                        });
                    }
                }
                ProviderTransport::Mock => {}
            }
        }

        issues
    }

    pub fn has_errors(&self) -> bool {
        self.validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default value helpers (serde)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_port() -> u16 {
    4317
}
fn d_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn d_root_dir() -> PathBuf {
    PathBuf::from(".")
}
fn d_max_concurrency() -> usize {
    3
}
fn d_max_iterations() -> u32 {
    50
}
fn d_max_turns_per_node() -> u32 {
    25
}
fn d_docs_dir() -> PathBuf {
    PathBuf::from("./docs")
}
fn d_stall_threshold() -> u32 {
    20
}
fn d_exec_timeout() -> u64 {
    120
}
fn d_max_output_chars() -> usize {
    200_000
}
fn d_replay_turns() -> usize {
    3
}

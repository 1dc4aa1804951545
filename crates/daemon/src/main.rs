//! The `agentgrid` daemon binary.
//!
//! `serve` (the default) loads and validates the configuration, builds
//! the runtime, recovers persisted runs, and parks until ctrl-c; the
//! shutdown path flushes every dirty snapshot before the process
//! exits. Unrecoverable startup failures exit non-zero.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ag_domain::config::{Config, ConfigSeverity};
use ag_runtime::Runtime;

#[derive(Parser)]
#[command(name = "agentgrid", about = "Multi-agent orchestration daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "agentgrid.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default).
    Serve,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the configuration and report issues.
    Validate,
    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            serve(config).await
        }
        Some(Command::Config { command }) => {
            let config = load_config(&cli.config)?;
            match command {
                ConfigCommand::Validate => {
                    let issues = config.validate();
                    for issue in &issues {
                        eprintln!("{issue}");
                    }
                    if config.has_errors() {
                        std::process::exit(1);
                    }
                    println!("configuration OK ({} warning(s))", issues.len());
                    Ok(())
                }
                ConfigCommand::Show => {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                    Ok(())
                }
            }
        }
        Some(Command::Version) => {
            println!("agentgrid {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON logs with env-filter overrides.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ag_runtime=debug")),
        )
        .json()
        .init();
}

/// Load the TOML config; a missing file means defaults.
fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("AgentGrid starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir '{}'", config.data_dir.display()))?;
    let port = config.server.port;
    let data_dir = config.data_dir.clone();

    // ── Runtime + recovery ──────────────────────────────────────────
    let runtime = Arc::new(Runtime::new(config).context("initializing runtime")?);
    let recovered = runtime.recover();
    tracing::info!(
        %port,
        data_dir = %data_dir.display(),
        recovered,
        providers = runtime.config().providers.len(),
        "runtime ready; transport may attach"
    );

    // ── Park until shutdown ─────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");

    runtime.shutdown().await;
    tracing::info!("AgentGrid stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 4317);
    }

    #[test]
    fn config_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentgrid.toml");
        std::fs::write(&path, "[server]\nport = 5000\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn malformed_config_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentgrid.toml");
        std::fs::write(&path, "[server\nport=").unwrap();
        assert!(load_config(&path).is_err());
    }
}

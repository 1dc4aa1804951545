//! Stateless stream-json CLI adapter.
//!
//! Spawn-per-turn: every `send` launches the provider command with the
//! prompt as the final argument and drains one turn of NDJSON events
//! from stdout. The protocol preserves no state between invocations,
//! so resume is forced off unless the provider offers continuation
//! flags (`resumeArgs`), which are appended together with the last
//! announced session id on turns after the first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use ag_domain::config::ProviderConfig;
use ag_domain::error::{Error, Result};
use ag_domain::event::ConsoleStream;
use ag_domain::ApprovalResolution;

use crate::normalize::LineNormalizer;
use crate::traits::{AdapterEvent, EventSink, ProviderAdapter, TurnRequest};

pub struct CliStreamJsonAdapter {
    provider: String,
    config: ProviderConfig,
    events: EventSink,
    session_id: Arc<RwLock<Option<String>>>,
    /// Kill switch for the in-flight turn's child, if any.
    current_kill: Mutex<Option<mpsc::Sender<()>>>,
}

impl CliStreamJsonAdapter {
    pub fn new(provider: impl Into<String>, config: ProviderConfig, events: EventSink) -> Self {
        Self {
            provider: provider.into(),
            config,
            events,
            session_id: Arc::new(RwLock::new(None)),
            current_kill: Mutex::new(None),
        }
    }

    fn provider_error(&self, message: impl Into<String>) -> Error {
        Error::Provider {
            provider: self.provider.clone(),
            message: message.into(),
        }
    }
}

/// Assemble the argv for one spawn: base args, then resume args + the
/// session id (when known and configured), then the prompt.
pub fn build_turn_args(
    config: &ProviderConfig,
    session_id: Option<&str>,
    prompt: &str,
) -> Vec<String> {
    let mut args = config.args.clone();
    if let Some(session) = session_id {
        if !config.resume_args.is_empty() {
            args.extend(config.resume_args.iter().cloned());
            args.push(session.to_owned());
        }
    }
    args.push(prompt.to_owned());
    args
}

#[async_trait::async_trait]
impl ProviderAdapter for CliStreamJsonAdapter {
    async fn start(&self) -> Result<()> {
        // Spawn-per-turn: nothing to bring up ahead of the first send.
        Ok(())
    }

    async fn close(&self) {
        self.interrupt().await;
    }

    async fn send(&self, turn: TurnRequest) -> Result<()> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| self.provider_error("no command configured"))?;

        let session = self.session_id.read().clone();
        let args = build_turn_args(&self.config, session.as_deref(), &turn.prompt);

        let mut cmd = Command::new(command);
        cmd.args(&args);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| self.provider_error(format!("failed to spawn '{command}': {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        *self.current_kill.lock().await = Some(kill_tx);

        let final_seen = Arc::new(AtomicBool::new(false));

        let events = self.events.clone();
        let session_slot = self.session_id.clone();
        let final_flag = final_seen.clone();
        let stdout_task = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut normalizer = LineNormalizer::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for event in normalizer.push_line(&line) {
                    match &event {
                        AdapterEvent::SessionAnnounced { session_id } => {
                            *session_slot.write() = Some(session_id.clone());
                        }
                        AdapterEvent::AssistantFinal { .. } => {
                            final_flag.store(true, Ordering::Release);
                        }
                        _ => {}
                    }
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        let events = self.events.clone();
        let stderr_task = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let chunk = AdapterEvent::Console {
                    stream: ConsoleStream::Stderr,
                    text: line,
                };
                if events.send(chunk).await.is_err() {
                    return;
                }
            }
        });

        // Monitor the spawned turn to completion in the background;
        // send() returns as soon as the turn is in flight.
        let events = self.events.clone();
        let provider = self.provider.clone();
        let turn_id = turn.turn_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = child.wait() => {
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    match result {
                        Ok(exit) if exit.success() => {
                            // A well-behaved provider ends with a final;
                            // synthesize one from the streamed deltas if not.
                            if !final_seen.load(Ordering::Acquire) {
                                let _ = events
                                    .send(AdapterEvent::AssistantFinal {
                                        content: None,
                                        tool_calls: Vec::new(),
                                    })
                                    .await;
                            }
                        }
                        Ok(exit) => {
                            tracing::warn!(provider = %provider, turn_id = %turn_id, %exit, "turn process failed");
                            let _ = events
                                .send(AdapterEvent::TurnFailed {
                                    message: format!("{provider} exited with {exit}"),
                                })
                                .await;
                        }
                        Err(e) => {
                            let _ = events
                                .send(AdapterEvent::TurnFailed {
                                    message: format!("{provider} wait failed: {e}"),
                                })
                                .await;
                        }
                    }
                }
                _ = kill_rx.recv() => {
                    let _ = child.kill().await;
                    stdout_task.abort();
                    stderr_task.abort();
                }
            }
        });

        Ok(())
    }

    async fn interrupt(&self) {
        if let Some(kill) = self.current_kill.lock().await.take() {
            let _ = kill.try_send(());
        }
    }

    async fn resolve_approval(
        &self,
        approval_id: &str,
        _resolution: &ApprovalResolution,
    ) -> Result<()> {
        // Spawn-per-turn providers have no channel to answer on; the
        // runtime's own approval gate handles these nodes.
        Err(self.provider_error(format!(
            "stateless provider cannot resolve approval {approval_id}"
        )))
    }

    async fn reset_session(&self) -> Result<()> {
        self.interrupt().await;
        *self.session_id.write() = None;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn supports_resume(&self) -> bool {
        // Stateless protocol: only argument-based resume counts.
        !self.config.resume_args.is_empty()
    }

    fn replay_turns(&self) -> usize {
        self.config.replay_turns
    }

    fn native_tools(&self) -> bool {
        self.config.native_tools
    }
}

//! Stateful CLI adapter.
//!
//! One long-lived child process per node session. Prompts go in as one
//! NDJSON line per turn on stdin; the child streams NDJSON events back
//! on stdout (see [`crate::normalize`]). Interrupts and approval
//! resolutions are forwarded as control lines, best-effort — the
//! process keeps its own conversation state, which is what makes
//! `PromptKind::Delta` turns possible.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use ag_domain::config::ProviderConfig;
use ag_domain::error::{Error, Result};
use ag_domain::event::ConsoleStream;
use ag_domain::ApprovalResolution;

use crate::normalize::LineNormalizer;
use crate::traits::{AdapterEvent, EventSink, PromptKind, ProviderAdapter, TurnRequest};

struct ChildHandle {
    stdin_tx: mpsc::Sender<String>,
    kill_tx: mpsc::Sender<()>,
}

pub struct CliStatefulAdapter {
    provider: String,
    config: ProviderConfig,
    events: EventSink,
    child: Mutex<Option<ChildHandle>>,
    session_id: Arc<RwLock<Option<String>>>,
}

impl CliStatefulAdapter {
    pub fn new(provider: impl Into<String>, config: ProviderConfig, events: EventSink) -> Self {
        Self {
            provider: provider.into(),
            config,
            events,
            child: Mutex::new(None),
            session_id: Arc::new(RwLock::new(None)),
        }
    }

    fn provider_error(&self, message: impl Into<String>) -> Error {
        Error::Provider {
            provider: self.provider.clone(),
            message: message.into(),
        }
    }

    async fn write_control(&self, line: String) -> Result<()> {
        let guard = self.child.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| self.provider_error("session not started"))?;
        handle
            .stdin_tx
            .send(line)
            .await
            .map_err(|_| self.provider_error("session stdin closed"))
    }

    async fn kill_child(&self) {
        let handle = self.child.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.kill_tx.try_send(());
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for CliStatefulAdapter {
    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| self.provider_error("no command configured"))?;

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| self.provider_error(format!("failed to spawn '{command}': {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        // Stdout: protocol events.
        let events = self.events.clone();
        let session_slot = self.session_id.clone();
        let stdout_task = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut normalizer = LineNormalizer::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for event in normalizer.push_line(&line) {
                    if let AdapterEvent::SessionAnnounced { session_id } = &event {
                        *session_slot.write() = Some(session_id.clone());
                    }
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        // Stderr: console chunks.
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

        // Stdin writer.
        let stdin_task = tokio::spawn(async move {
            let Some(mut stdin) = stdin else { return };
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    return;
                }
                let _ = stdin.flush().await;
            }
        });

        // Monitor: exit or kill, then announce closure.
        let events = self.events.clone();
        let provider = self.provider.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = child.wait() => {
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    stdin_task.abort();
                    match result {
                        Ok(exit) if exit.success() => {}
                        Ok(exit) => {
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
                    stdin_task.abort();
                }
            }
            let _ = events.send(AdapterEvent::Closed).await;
        });

        *guard = Some(ChildHandle { stdin_tx, kill_tx });
        tracing::debug!(provider = %self.provider, "stateful CLI session started");
        Ok(())
    }

    async fn close(&self) {
        self.kill_child().await;
    }

    async fn send(&self, turn: TurnRequest) -> Result<()> {
        self.start().await?;
        let kind = match turn.prompt_kind {
            PromptKind::Full => "full",
            PromptKind::Delta => "delta",
        };
        let line = json!({
            "prompt": turn.prompt,
            "turnId": turn.turn_id,
            "promptKind": kind,
        })
        .to_string();
        self.write_control(line).await
    }

    async fn interrupt(&self) {
        let _ = self.write_control(json!({ "interrupt": true }).to_string()).await;
    }

    async fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: &ApprovalResolution,
    ) -> Result<()> {
        let line = json!({
            "approvalResolution": {
                "approvalId": approval_id,
                "status": resolution.status,
                "feedback": resolution.feedback,
                "modifiedArgs": resolution.modified_args,
            }
        })
        .to_string();
        self.write_control(line).await
    }

    async fn reset_session(&self) -> Result<()> {
        self.kill_child().await;
        *self.session_id.write() = None;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn supports_resume(&self) -> bool {
        self.config.supports_resume()
    }

    fn replay_turns(&self) -> usize {
        self.config.replay_turns
    }

    fn native_tools(&self) -> bool {
        self.config.native_tools
    }
}

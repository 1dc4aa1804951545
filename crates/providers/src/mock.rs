//! Mock adapter — scripted turns for tests and offline demos.
//!
//! A [`MockScript`] is a shared queue of [`MockTurn`]s; every node
//! bound to the same mock provider name plays from the same queue.
//! With an empty queue the adapter echoes: the final message repeats
//! the most recent inbox line from the prompt (or the whole prompt).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use ag_domain::config::ProviderConfig;
use ag_domain::error::Result;
use ag_domain::{id, ApprovalResolution, ToolCall, UsageTotals};

use crate::traits::{AdapterEvent, EventSink, ProviderAdapter, TurnRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Script
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted assistant turn.
#[derive(Debug, Clone, Default)]
pub struct MockTurn {
    pub thinking: Option<String>,
    /// Deltas to stream ahead of the final. Empty = stream the final
    /// text as a single delta.
    pub deltas: Vec<String>,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageTotals>,
    /// Fail the turn with this message instead of finishing.
    pub fail: Option<String>,
}

impl MockTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage = Some(UsageTotals {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        });
        self
    }
}

/// Shared queue of scripted turns for one mock provider name.
#[derive(Default)]
pub struct MockScript {
    turns: Mutex<VecDeque<MockTurn>>,
}

impl MockScript {
    pub fn push(&self, turn: MockTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn pop(&self) -> Option<MockTurn> {
        self.turns.lock().pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MockAdapter {
    config: ProviderConfig,
    events: EventSink,
    script: Arc<MockScript>,
    session_id: Arc<RwLock<Option<String>>>,
    interrupted: Arc<AtomicBool>,
}

impl MockAdapter {
    pub fn new(config: ProviderConfig, events: EventSink, script: Arc<MockScript>) -> Self {
        Self {
            config,
            events,
            script,
            session_id: Arc::new(RwLock::new(None)),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Pull the text a bare echo turn should repeat: the message of the
/// last inbox line if the prompt carries one, else the last non-empty
/// line.
pub fn echo_text(prompt: &str) -> String {
    let inbox_line = prompt
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with("- [from "))
        .and_then(|line| line.split_once("] ").map(|(_, msg)| msg.trim()));
    if let Some(message) = inbox_line {
        return message.to_owned();
    }
    prompt
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_owned()
}

#[async_trait::async_trait]
impl ProviderAdapter for MockAdapter {
    async fn start(&self) -> Result<()> {
        let session_id = {
            let mut guard = self.session_id.write();
            if guard.is_none() {
                let session_id = id::new_id("mock");
                *guard = Some(session_id.clone());
                Some(session_id)
            } else {
                None
            }
        };
        if let Some(session_id) = session_id {
            let _ = self
                .events
                .send(AdapterEvent::SessionAnnounced { session_id })
                .await;
        }
        Ok(())
    }

    async fn close(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    async fn send(&self, turn: TurnRequest) -> Result<()> {
        self.start().await?;
        self.interrupted.store(false, Ordering::Release);

        let scripted = self.script.pop();
        let events = self.events.clone();
        let interrupted = self.interrupted.clone();

        tokio::spawn(async move {
            let play = scripted.unwrap_or_else(|| MockTurn::text(echo_text(&turn.prompt)));

            if let Some(message) = play.fail {
                let _ = events.send(AdapterEvent::TurnFailed { message }).await;
                return;
            }

            if let Some(thinking) = play.thinking {
                if interrupted.load(Ordering::Acquire) {
                    return;
                }
                let _ = events
                    .send(AdapterEvent::ThinkingDelta {
                        text: thinking.clone(),
                    })
                    .await;
                let _ = events
                    .send(AdapterEvent::ThinkingFinal { content: thinking })
                    .await;
            }

            let deltas = if play.deltas.is_empty() {
                vec![play.text.clone()]
            } else {
                play.deltas
            };
            for delta in deltas {
                if interrupted.load(Ordering::Acquire) {
                    return;
                }
                if !delta.is_empty() {
                    let _ = events.send(AdapterEvent::AssistantDelta { text: delta }).await;
                }
                tokio::task::yield_now().await;
            }

            if interrupted.load(Ordering::Acquire) {
                return;
            }
            if let Some(usage) = play.usage {
                let _ = events.send(AdapterEvent::Usage(usage)).await;
            }
            let _ = events
                .send(AdapterEvent::AssistantFinal {
                    content: Some(play.text),
                    tool_calls: play.tool_calls,
                })
                .await;
        });

        Ok(())
    }

    async fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    async fn resolve_approval(
        &self,
        _approval_id: &str,
        _resolution: &ApprovalResolution,
    ) -> Result<()> {
        Ok(())
    }

    async fn reset_session(&self) -> Result<()> {
        *self.session_id.write() = None;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn supports_resume(&self) -> bool {
        self.config.stateful_streaming
    }

    fn replay_turns(&self) -> usize {
        self.config.replay_turns
    }

    fn native_tools(&self) -> bool {
        self.config.native_tools
    }
}

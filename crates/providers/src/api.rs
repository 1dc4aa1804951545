//! HTTP + SSE adapter.
//!
//! Each turn is one streaming POST against the provider's messages
//! endpoint. The response streams content-block events (text deltas,
//! a separate thinking stream, tool-use blocks assembled from partial
//! JSON) which map onto canonical adapter events. The protocol keeps
//! no conversation state server-side between our calls, so resume is
//! always off and the node runner falls back to transcript replay.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use ag_domain::config::ProviderConfig;
use ag_domain::error::{Error, Result};
use ag_domain::{ApprovalResolution, ToolCall, UsageTotals};

use crate::sse;
use crate::traits::{AdapterEvent, EventSink, ProviderAdapter, TurnRequest};

const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct ApiAdapter {
    provider: String,
    config: ProviderConfig,
    events: EventSink,
    client: reqwest::Client,
    /// Abort switch for the in-flight turn, if any.
    current_abort: Mutex<Option<mpsc::Sender<()>>>,
}

impl ApiAdapter {
    pub fn new(provider: impl Into<String>, config: ProviderConfig, events: EventSink) -> Self {
        Self {
            provider: provider.into(),
            config,
            events,
            client: reqwest::Client::new(),
            current_abort: Mutex::new(None),
        }
    }

    fn provider_error(&self, message: impl Into<String>) -> Error {
        Error::Provider {
            provider: self.provider.clone(),
            message: message.into(),
        }
    }

    fn request_body(&self, prompt: &str) -> Value {
        let mut body = json!({
            "stream": true,
            "max_tokens": self.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(model) = &self.config.model {
            body["model"] = json!(model);
        }
        body
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ApiAdapter {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.interrupt().await;
    }

    async fn send(&self, turn: TurnRequest) -> Result<()> {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .ok_or_else(|| self.provider_error("no apiBaseUrl configured"))?
            .trim_end_matches('/')
            .to_owned();

        let mut request = self
            .client
            .post(format!("{base}/messages"))
            .header("content-type", "application/json")
            .json(&self.request_body(&turn.prompt));
        if let Some(key) = &self.config.api_key {
            request = request.header("authorization", format!("Bearer {key}"));
        }

        let (abort_tx, mut abort_rx) = mpsc::channel::<()>(1);
        *self.current_abort.lock().await = Some(abort_tx);

        let events = self.events.clone();
        let provider = self.provider.clone();
        tokio::spawn(async move {
            let stream = async {
                let mut response = request
                    .send()
                    .await
                    .map_err(|e| format!("request failed: {e}"))?;
                if !response.status().is_success() {
                    return Err(format!("HTTP {}", response.status()));
                }

                let mut buffer = String::new();
                let mut state = StreamState::default();
                loop {
                    let chunk = tokio::select! {
                        chunk = response.chunk() => chunk.map_err(|e| format!("stream failed: {e}"))?,
                        _ = abort_rx.recv() => return Ok(()),
                    };
                    let Some(bytes) = chunk else { break };
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for payload in sse::drain_data_payloads(&mut buffer) {
                        for event in parse_sse_payload(&mut state, &payload) {
                            if events.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                for payload in sse::flush_remaining(&mut buffer) {
                    for event in parse_sse_payload(&mut state, &payload) {
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                if !state.finished {
                    let _ = events
                        .send(AdapterEvent::AssistantFinal {
                            content: None,
                            tool_calls: state.take_tool_calls(),
                        })
                        .await;
                }
                Ok::<(), String>(())
            }
            .await;

            if let Err(message) = stream {
                tracing::warn!(provider = %provider, error = %message, "api turn failed");
                let _ = events.send(AdapterEvent::TurnFailed { message }).await;
            }
        });

        Ok(())
    }

    async fn interrupt(&self) {
        if let Some(abort) = self.current_abort.lock().await.take() {
            let _ = abort.try_send(());
        }
    }

    async fn resolve_approval(
        &self,
        approval_id: &str,
        _resolution: &ApprovalResolution,
    ) -> Result<()> {
        Err(self.provider_error(format!(
            "api provider has no native approval channel for {approval_id}"
        )))
    }

    async fn reset_session(&self) -> Result<()> {
        self.interrupt().await;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn supports_resume(&self) -> bool {
        // Stateless protocol: force resume off regardless of config.
        false
    }

    fn replay_turns(&self) -> usize {
        self.config.replay_turns
    }

    fn native_tools(&self) -> bool {
        self.config.native_tools
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE payload parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembly state across one turn's SSE payloads: tool-use blocks
/// arrive as a start event plus partial-JSON argument deltas, keyed by
/// content-block index.
#[derive(Default)]
pub(crate) struct StreamState {
    tool_blocks: HashMap<u64, (String, String, String)>, // index -> (id, name, args buffer)
    completed_tools: Vec<ToolCall>,
    finished: bool,
}

impl StreamState {
    fn take_tool_calls(&mut self) -> Vec<ToolCall> {
        // Close any block that never saw a content_block_stop.
        let open: Vec<u64> = self.tool_blocks.keys().copied().collect();
        for index in open {
            self.close_tool_block(index);
        }
        std::mem::take(&mut self.completed_tools)
    }

    fn close_tool_block(&mut self, index: u64) {
        let Some((id, name, args_buf)) = self.tool_blocks.remove(&index) else {
            return;
        };
        let args = if args_buf.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&args_buf).unwrap_or_else(|e| {
                tracing::warn!(tool = %name, error = %e, "tool arguments are not valid JSON");
                Value::Object(Default::default())
            })
        };
        self.completed_tools.push(ToolCall { id, name, args });
    }
}

pub(crate) fn parse_sse_payload(state: &mut StreamState, payload: &str) -> Vec<AdapterEvent> {
    if payload == "[DONE]" {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Vec::new();
    };
    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "content_block_start" => {
            let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
            if let Some(block) = value.get("content_block") {
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    state.tool_blocks.insert(index, (id, name, String::new()));
                }
            }
            Vec::new()
        }

        "content_block_delta" => {
            let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
            let Some(delta) = value.get("delta") else {
                return Vec::new();
            };
            match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                "text_delta" => delta
                    .get("text")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(|t| vec![AdapterEvent::AssistantDelta { text: t.to_owned() }])
                    .unwrap_or_default(),
                "thinking_delta" => delta
                    .get("thinking")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(|t| vec![AdapterEvent::ThinkingDelta { text: t.to_owned() }])
                    .unwrap_or_default(),
                "input_json_delta" => {
                    if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                        if let Some(block) = state.tool_blocks.get_mut(&index) {
                            block.2.push_str(partial);
                        }
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            }
        }

        "content_block_stop" => {
            let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
            state.close_tool_block(index);
            Vec::new()
        }

        "message_delta" => value
            .get("usage")
            .and_then(parse_api_usage)
            .map(|usage| vec![AdapterEvent::Usage(usage)])
            .unwrap_or_default(),

        "message_stop" => {
            state.finished = true;
            vec![AdapterEvent::AssistantFinal {
                content: None,
                tool_calls: state.take_tool_calls(),
            }]
        }

        "error" => vec![AdapterEvent::TurnFailed {
            message: value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("provider error")
                .to_owned(),
        }],

        _ => Vec::new(),
    }
}

fn parse_api_usage(value: &Value) -> Option<UsageTotals> {
    let input = value.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = value.get("output_tokens").and_then(Value::as_u64)?;
    Some(UsageTotals {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    })
}

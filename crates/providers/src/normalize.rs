//! Stream-json normalization.
//!
//! CLI providers speaking the `stream-json` protocol emit one JSON
//! event per stdout line. [`LineNormalizer`] maps those lines onto
//! canonical [`AdapterEvent`]s. Two dialects are accepted: the plain
//! shape (`{"type":"delta","text":…}`) and the result-oriented shape
//! some assistants produce (`{"type":"result","result":…,"usage":…}`).
//! Anything that does not parse as a protocol event becomes a console
//! chunk — raw output is never dropped.

use serde_json::Value;

use ag_domain::event::ConsoleStream;
use ag_domain::{ToolCall, UsageTotals};

use crate::traits::AdapterEvent;

/// Per-turn normalization state: native tool calls announced before
/// the final are buffered and attached to it.
#[derive(Default)]
pub struct LineNormalizer {
    pending_tools: Vec<ToolCall>,
}

impl LineNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map one stdout line to adapter events.
    pub fn push_line(&mut self, line: &str) -> Vec<AdapterEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return vec![console(trimmed)];
        };
        let Some(event_type) = value.get("type").and_then(Value::as_str) else {
            return vec![console(trimmed)];
        };

        match event_type {
            // {"type":"session"|"system", "session_id"|"sessionId": "…"}
            "session" | "system" => match session_id_of(&value) {
                Some(session_id) => vec![AdapterEvent::SessionAnnounced { session_id }],
                None => Vec::new(),
            },

            "delta" | "assistant_delta" => text_of(&value, "text")
                .map(|text| vec![AdapterEvent::AssistantDelta { text }])
                .unwrap_or_default(),

            "thinking" | "thinking_delta" => text_of(&value, "text")
                .map(|text| vec![AdapterEvent::ThinkingDelta { text }])
                .unwrap_or_default(),

            "thinking_final" => vec![AdapterEvent::ThinkingFinal {
                content: text_of(&value, "content").unwrap_or_default(),
            }],

            // Native tool call announced ahead of the final.
            "tool_call" => {
                match parse_tool_call(&value) {
                    Some(call) => self.pending_tools.push(call),
                    None => return vec![console(trimmed)],
                }
                Vec::new()
            }

            "final" => self.finish(&value, text_of(&value, "content")),

            // Result-oriented dialect: the whole message arrives at once.
            "result" => self.finish(&value, text_of(&value, "result")),

            "usage" => value
                .get("usage")
                .and_then(parse_usage)
                .or_else(|| parse_usage(&value))
                .map(|usage| vec![AdapterEvent::Usage(usage)])
                .unwrap_or_default(),

            "approval_request" => {
                let approval_id = text_of(&value, "approval_id")
                    .or_else(|| text_of(&value, "approvalId"))
                    .unwrap_or_default();
                let tool = text_of(&value, "tool").unwrap_or_default();
                vec![AdapterEvent::ApprovalRequested {
                    approval_id,
                    tool,
                    context: value.get("context").cloned().unwrap_or(Value::Null),
                }]
            }

            "error" => vec![AdapterEvent::TurnFailed {
                message: text_of(&value, "message").unwrap_or_else(|| "provider error".into()),
            }],

            _ => vec![console(trimmed)],
        }
    }

    fn finish(&mut self, value: &Value, content: Option<String>) -> Vec<AdapterEvent> {
        let mut events = Vec::new();
        if let Some(usage) = value.get("usage").and_then(parse_usage) {
            events.push(AdapterEvent::Usage(usage));
        }

        let mut tool_calls = std::mem::take(&mut self.pending_tools);
        tool_calls.extend(parse_tool_calls(
            value.get("toolCalls").or(value.get("tool_calls")),
        ));

        events.push(AdapterEvent::AssistantFinal {
            content,
            tool_calls,
        });
        events
    }
}

fn console(text: &str) -> AdapterEvent {
    AdapterEvent::Console {
        stream: ConsoleStream::Stdout,
        text: text.to_owned(),
    }
}

fn text_of(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn session_id_of(value: &Value) -> Option<String> {
    text_of(value, "session_id").or_else(|| text_of(value, "sessionId"))
}

fn parse_tool_call(value: &Value) -> Option<ToolCall> {
    let name = text_of(value, "name")?;
    Some(ToolCall {
        id: text_of(value, "id").unwrap_or_else(|| ag_domain::id::new_id(ag_domain::id::CALL)),
        name,
        args: value
            .get("args")
            .cloned()
            .unwrap_or(Value::Object(Default::default())),
    })
}

fn parse_tool_calls(value: Option<&Value>) -> Vec<ToolCall> {
    value
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default()
}

fn parse_usage(value: &Value) -> Option<UsageTotals> {
    let input = value
        .get("input_tokens")
        .or(value.get("inputTokens"))?
        .as_u64()?;
    let output = value
        .get("output_tokens")
        .or(value.get("outputTokens"))?
        .as_u64()?;
    Some(UsageTotals {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(line: &str) -> Vec<AdapterEvent> {
        LineNormalizer::new().push_line(line)
    }

    #[test]
    fn delta_line() {
        let events = one(r#"{"type":"delta","text":"hel"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AdapterEvent::AssistantDelta { text } if text == "hel"
        ));
    }

    #[test]
    fn thinking_is_a_separate_stream() {
        let events = one(r#"{"type":"thinking","text":"let me see"}"#);
        assert!(matches!(&events[0], AdapterEvent::ThinkingDelta { .. }));
    }

    #[test]
    fn final_with_content_and_tools() {
        let events = one(
            r#"{"type":"final","content":"done","tool_calls":[{"id":"t1","name":"command","args":{"cmd":"ls"}}]}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            AdapterEvent::AssistantFinal {
                content,
                tool_calls,
            } => {
                assert_eq!(content.as_deref(), Some("done"));
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].name, "command");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn standalone_tool_call_lines_buffer_until_final() {
        let mut normalizer = LineNormalizer::new();
        assert!(normalizer
            .push_line(r#"{"type":"tool_call","id":"t1","name":"command","args":{"cmd":"ls"}}"#)
            .is_empty());
        assert!(normalizer
            .push_line(r#"{"type":"tool_call","name":"list_files","args":{}}"#)
            .is_empty());

        let events = normalizer.push_line(r#"{"type":"final","content":"running"}"#);
        match &events[0] {
            AdapterEvent::AssistantFinal { tool_calls, .. } => {
                assert_eq!(tool_calls.len(), 2);
                assert_eq!(tool_calls[0].id, "t1");
                assert!(tool_calls[1].id.starts_with("call_"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn result_dialect_carries_usage() {
        let events = one(
            r#"{"type":"result","result":"hello","usage":{"input_tokens":10,"output_tokens":4}}"#,
        );
        assert_eq!(events.len(), 2);
        match &events[0] {
            AdapterEvent::Usage(usage) => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.total_tokens, 14);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(&events[1], AdapterEvent::AssistantFinal { .. }));
    }

    #[test]
    fn session_announcement_both_spellings() {
        for line in [
            r#"{"type":"session","session_id":"s1"}"#,
            r#"{"type":"system","sessionId":"s1"}"#,
        ] {
            let events = one(line);
            assert!(matches!(
                &events[0],
                AdapterEvent::SessionAnnounced { session_id } if session_id == "s1"
            ));
        }
    }

    #[test]
    fn non_json_becomes_console_chunk() {
        let events = one("npm WARN deprecated foo@1.0.0");
        match &events[0] {
            AdapterEvent::Console { stream, text } => {
                assert_eq!(*stream, ConsoleStream::Stdout);
                assert!(text.contains("npm WARN"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_json_type_becomes_console_chunk() {
        let events = one(r#"{"type":"heartbeat"}"#);
        assert!(matches!(&events[0], AdapterEvent::Console { .. }));
    }

    #[test]
    fn blank_lines_are_dropped() {
        assert!(one("   ").is_empty());
    }

    #[test]
    fn error_line_fails_the_turn() {
        let events = one(r#"{"type":"error","message":"rate limited"}"#);
        assert!(matches!(
            &events[0],
            AdapterEvent::TurnFailed { message } if message == "rate limited"
        ));
    }

    #[test]
    fn approval_request_line() {
        let events = one(
            r#"{"type":"approval_request","approval_id":"a1","tool":"command","context":{"cmd":"rm"}}"#,
        );
        match &events[0] {
            AdapterEvent::ApprovalRequested {
                approval_id, tool, ..
            } => {
                assert_eq!(approval_id, "a1");
                assert_eq!(tool, "command");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

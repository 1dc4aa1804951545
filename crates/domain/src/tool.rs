//! Tool calls — the closed tool set and the embedded JSON-line wire form.
//!
//! Tool calls reach the executor from two sources: native `toolCalls`
//! attached to an adapter's final message, and `tool_call` JSON lines
//! embedded in the assistant's text (one `{"tool_call":{…}}` object per
//! line). When both appear in one turn, native calls win.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The closed tool set. Dispatch is an exhaustive match so a new tool
/// forces updates at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    Command,
    ReadFile,
    WriteFile,
    ListFiles,
    DeleteFile,
    SpawnNode,
    CreateEdge,
    SendHandoff,
}

impl ToolName {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "command" => Some(Self::Command),
            "read_file" => Some(Self::ReadFile),
            "write_file" => Some(Self::WriteFile),
            "list_files" => Some(Self::ListFiles),
            "delete_file" => Some(Self::DeleteFile),
            "spawn_node" => Some(Self::SpawnNode),
            "create_edge" => Some(Self::CreateEdge),
            "send_handoff" => Some(Self::SendHandoff),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::ListFiles => "list_files",
            Self::DeleteFile => "delete_file",
            Self::SpawnNode => "spawn_node",
            Self::CreateEdge => "create_edge",
            Self::SendHandoff => "send_handoff",
        }
    }

    /// Tools that mutate the run graph or route messages.
    pub fn is_agent_management(self) -> bool {
        matches!(self, Self::SpawnNode | Self::CreateEdge | Self::SendHandoff)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Calls + results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One structured tool request from the assistant. The name is kept as
/// a string at the wire layer; the executor resolves it to [`ToolName`]
/// and rejects unknown names with an explicit error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id::new_id(id::CALL),
            name: name.into(),
            args,
        }
    }
}

/// Outcome of executing one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub ok: bool,
    /// Textual output (command stdout, handoff confirmation, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Structured result (file listings, spawned node info, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok_output(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            ok: true,
            output: Some(output.into()),
            result: None,
            error: None,
        }
    }

    pub fn ok_result(call: &ToolCall, result: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            ok: true,
            output: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            ok: false,
            output: None,
            result: None,
            error: Some(error.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Embedded JSON-line parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract `{"tool_call":{…}}` lines from assistant text.
///
/// A line is a candidate when, after trimming, it starts with `{` and
/// parses to an object with a `tool_call` key. The call needs a `name`
/// and an `args` object; the legacy `params` key is accepted as an
/// alias of `args` with a warning; a missing `id` gets a generated one.
/// Malformed candidates are skipped (they remain plain prose).
pub fn parse_embedded_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        let Some(body) = value.get("tool_call") else {
            continue;
        };
        let Some(name) = body.get("name").and_then(Value::as_str) else {
            tracing::warn!(line = trimmed, "tool_call line has no name; skipping");
            continue;
        };

        let args = match (body.get("args"), body.get("params")) {
            (Some(args), _) => args.clone(),
            (None, Some(params)) => {
                tracing::warn!(
                    tool = name,
                    "tool_call uses legacy 'params' key; treating as 'args'"
                );
                params.clone()
            }
            (None, None) => Value::Object(Default::default()),
        };

        let call_id = body
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| id::new_id(id::CALL));

        calls.push(ToolCall {
            id: call_id,
            name: name.to_owned(),
            args,
        });
    }

    calls
}

/// Strip tool-call JSON lines from assistant text, leaving the prose.
pub fn strip_tool_call_lines(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                return true;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => value.get("tool_call").is_none(),
                Err(_) => true,
            }
        })
        .collect();
    kept.join("\n")
}

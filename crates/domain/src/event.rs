//! The canonical event union.
//!
//! Every state change and every streamed fragment becomes one `Event`
//! envelope `{id, runId, ts, type, …}`. Events fan out to subscribers
//! through the bus and append to the per-run NDJSON log; a subset
//! ("patch-style" events) is folded left-to-right to rebuild run state
//! when no snapshot exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{ApprovalRequest, ApprovalStatus};
use crate::artifact::Artifact;
use crate::edge::Edge;
use crate::envelope::Envelope;
use crate::id;
use crate::node::{Connection, Node, NodeStatus};
use crate::run::{GlobalMode, OrchestrationMode, Run, RunStatus, UsageTotals};
use crate::tool::ToolCall;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub run_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: id::new_id(id::EVENT),
            run_id: run_id.into(),
            ts: Utc::now(),
            kind,
        }
    }

    /// The node this event concerns, when it concerns exactly one.
    pub fn node_id(&self) -> Option<&str> {
        self.kind.node_id()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Variants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    #[serde(rename = "run.created")]
    RunCreated { run: Run },

    #[serde(rename = "run.patch")]
    RunPatch { patch: RunPatch },

    #[serde(rename = "run.deleted")]
    RunDeleted {},

    #[serde(rename = "run.stalled")]
    RunStalled { evidence: StallEvidence },

    #[serde(rename = "node.created")]
    NodeCreated { node: Node },

    #[serde(rename = "node.patch")]
    NodePatch {
        #[serde(rename = "nodeId")]
        node_id: String,
        patch: NodePatch,
    },

    #[serde(rename = "node.deleted")]
    NodeDeleted {
        #[serde(rename = "nodeId")]
        node_id: String,
    },

    /// Live progress line for a node (summary updates).
    #[serde(rename = "node.progress")]
    NodeProgress {
        #[serde(rename = "nodeId")]
        node_id: String,
        summary: String,
    },

    #[serde(rename = "message.user")]
    UserMessage {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        content: String,
    },

    #[serde(rename = "message.assistant.delta")]
    AssistantDelta {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "turnId")]
        turn_id: String,
        text: String,
    },

    #[serde(rename = "message.assistant.final")]
    AssistantFinal {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "turnId")]
        turn_id: String,
        content: String,
        #[serde(rename = "toolCalls", default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },

    #[serde(rename = "message.assistant.thinking.delta")]
    ThinkingDelta {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "turnId")]
        turn_id: String,
        text: String,
    },

    #[serde(rename = "message.assistant.thinking.final")]
    ThinkingFinal {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "turnId")]
        turn_id: String,
        content: String,
    },

    #[serde(rename = "tool.proposed")]
    ToolProposed {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "turnId")]
        turn_id: String,
        call: ToolCall,
    },

    #[serde(rename = "tool.started")]
    ToolStarted {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
    },

    #[serde(rename = "tool.completed")]
    ToolCompleted {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "turnId")]
        turn_id: String,
        outcome: TurnOutcome,
    },

    #[serde(rename = "edge.created")]
    EdgeCreated { edge: Edge },

    #[serde(rename = "edge.deleted")]
    EdgeDeleted {
        #[serde(rename = "edgeId")]
        edge_id: String,
    },

    #[serde(rename = "handoff.sent")]
    HandoffSent { envelope: Envelope },

    /// Emitted at turn start when a node drains its inbox.
    #[serde(rename = "inbox.consumed")]
    InboxConsumed {
        #[serde(rename = "nodeId")]
        node_id: String,
        count: usize,
    },

    #[serde(rename = "artifact.created")]
    ArtifactCreated { artifact: Artifact },

    #[serde(rename = "approval.requested")]
    ApprovalRequested { approval: ApprovalRequest },

    #[serde(rename = "approval.resolved")]
    ApprovalResolved {
        #[serde(rename = "approvalId")]
        approval_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        status: ApprovalStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },

    #[serde(rename = "telemetry.usage")]
    TelemetryUsage {
        #[serde(rename = "nodeId", default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        usage: UsageTotals,
    },

    /// Raw stdout/stderr line from a node's child process.
    #[serde(rename = "console.chunk")]
    ConsoleChunk {
        #[serde(rename = "nodeId")]
        node_id: String,
        stream: ConsoleStream,
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOutcome {
    Ok,
    Failed,
    Interrupted,
}

impl EventKind {
    /// Whether this event contributes to a state rebuild (replay fold).
    /// Streaming fragments and tool telemetry do not.
    pub fn contributes_to_rebuild(&self) -> bool {
        matches!(
            self,
            Self::RunCreated { .. }
                | Self::RunPatch { .. }
                | Self::RunDeleted {}
                | Self::NodeCreated { .. }
                | Self::NodePatch { .. }
                | Self::NodeDeleted { .. }
                | Self::UserMessage { .. }
                | Self::EdgeCreated { .. }
                | Self::EdgeDeleted { .. }
                | Self::HandoffSent { .. }
                | Self::InboxConsumed { .. }
                | Self::ArtifactCreated { .. }
                | Self::ApprovalRequested { .. }
                | Self::ApprovalResolved { .. }
        )
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeCreated { node } => Some(&node.id),
            Self::NodePatch { node_id, .. }
            | Self::NodeDeleted { node_id }
            | Self::NodeProgress { node_id, .. }
            | Self::UserMessage { node_id, .. }
            | Self::AssistantDelta { node_id, .. }
            | Self::AssistantFinal { node_id, .. }
            | Self::ThinkingDelta { node_id, .. }
            | Self::ThinkingFinal { node_id, .. }
            | Self::ToolProposed { node_id, .. }
            | Self::ToolStarted { node_id, .. }
            | Self::ToolCompleted { node_id, .. }
            | Self::TurnCompleted { node_id, .. }
            | Self::InboxConsumed { node_id, .. }
            | Self::ApprovalResolved { node_id, .. }
            | Self::ConsoleChunk { node_id, .. } => Some(node_id),
            Self::ApprovalRequested { approval } => Some(&approval.node_id),
            Self::ArtifactCreated { artifact } => Some(&artifact.node_id),
            Self::HandoffSent { envelope } => Some(&envelope.from_node_id),
            Self::TelemetryUsage { node_id, .. } => node_id.as_deref(),
            Self::RunCreated { .. }
            | Self::RunPatch { .. }
            | Self::RunDeleted {}
            | Self::RunStalled { .. }
            | Self::EdgeCreated { .. }
            | Self::EdgeDeleted { .. } => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Patches
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Partial run update. `None` fields are untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OrchestrationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_mode: Option<GlobalMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_turns: Option<u32>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, run: &mut Run) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(mode) = self.mode {
            run.mode = mode;
        }
        if let Some(global_mode) = self.global_mode {
            run.global_mode = global_mode;
        }
        if let Some(layout) = &self.layout {
            run.layout = Some(layout.clone());
        }
        if let Some(usage) = self.usage {
            run.usage = usage;
        }
        if let Some(total_turns) = self.total_turns {
            run.total_turns = total_turns;
        }
        run.touch();
    }
}

/// Partial node update. `None` fields are untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_turn: Option<bool>,
}

impl NodePatch {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn session_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn apply(&self, node: &mut Node) {
        if let Some(status) = self.status {
            node.status = status;
        }
        if let Some(label) = &self.label {
            node.label = label.clone();
        }
        if let Some(alias) = &self.alias {
            node.alias = Some(alias.clone());
        }
        if let Some(provider) = &self.provider {
            node.provider = provider.clone();
        }
        if let Some(summary) = &self.summary {
            node.set_summary(summary);
        }
        if let Some(session_id) = &self.session_id {
            node.session.id = Some(session_id.clone());
        }
        if let Some(connection) = self.connection {
            node.connection = connection;
        }
        if let Some(inbox_count) = self.inbox_count {
            node.inbox_count = inbox_count;
        }
        if let Some(usage) = self.usage {
            node.usage = usage;
        }
        if let Some(completed_turns) = self.completed_turns {
            node.completed_turns = completed_turns;
        }
        if let Some(pending_turn) = self.pending_turn {
            node.pending_turn = pending_turn;
        }
        node.touch();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stall evidence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Carried by `run.stalled`: which signal repeated, how often, and what
/// the node was saying at the time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StallEvidence {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_failure: Option<String>,
    pub repeats: u32,
    /// The last few turn summaries (most recent last).
    pub summaries: Vec<String>,
}

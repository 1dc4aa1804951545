//! Node records — one turn-executing agent bound to a provider session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id;
use crate::run::UsageTotals;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Running,
    /// Suspended mid-turn awaiting an approval resolution.
    Blocked,
    Failed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities + permissions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who may manage the run graph (spawn nodes, create edges) on this
/// node's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeManagement {
    #[default]
    None,
    /// Only edges where this node is an endpoint.
    #[serde(rename = "self")]
    Self_,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub write_code: bool,
    #[serde(default)]
    pub write_docs: bool,
    #[serde(default)]
    pub run_commands: bool,
    #[serde(default)]
    pub edge_management: EdgeManagement,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            write_code: false,
            write_docs: true,
            run_commands: false,
            edge_management: EdgeManagement::None,
        }
    }
}

/// Whether provider-side tool permissions are skipped or gated behind
/// human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CliPermissionsMode {
    #[default]
    Skip,
    Gated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default)]
    pub cli_permissions_mode: CliPermissionsMode,
    /// Gate `spawn_node` / `create_edge` / `send_handoff` behind approval.
    #[serde(default)]
    pub agent_management_requires_approval: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session + connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Adapter-session bookkeeping. Reset on provider switch or explicit
/// node reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Opaque provider session identifier (announced by the adapter).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// True once a full prompt has been sent on this session.
    #[serde(default)]
    pub prompt_sent: bool,
    /// Hash of the system + role prompt blocks last sent; a change
    /// forces the next prompt back to `full`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_hash: Option<String>,
}

impl SessionState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Idle,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maximum length of the live-status summary string.
pub const SUMMARY_MAX_CHARS: usize = 140;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub run_id: String,
    pub label: String,
    /// Run-scoped unique alias; never collides with any node id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Role template name injected into the prompt's role block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub status: NodeStatus,
    /// Short live-status string (≤140 chars).
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub usage: UsageTotals,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub session: SessionState,
    #[serde(default)]
    pub connection: Connection,
    /// Mirror of the inbox queue length (invariant: always equal).
    #[serde(default)]
    pub inbox_count: usize,
    #[serde(default)]
    pub completed_turns: u32,
    /// Scheduler hint: run a turn even with an empty inbox.
    #[serde(default)]
    pub pending_turn: bool,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(run_id: impl Into<String>, label: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id::new_id(id::NODE),
            run_id: run_id.into(),
            label: label.into(),
            alias: None,
            template: None,
            provider: provider.into(),
            system_prompt: None,
            status: NodeStatus::Idle,
            summary: String::new(),
            usage: UsageTotals::default(),
            capabilities: Capabilities::default(),
            permissions: Permissions::default(),
            session: SessionState::default(),
            connection: Connection::default(),
            inbox_count: 0,
            completed_turns: 0,
            pending_turn: false,
            last_activity_at: now,
            created_at: now,
        }
    }

    /// Set the live summary, truncating to the display budget on a
    /// char boundary.
    pub fn set_summary(&mut self, summary: &str) {
        if summary.chars().count() <= SUMMARY_MAX_CHARS {
            self.summary = summary.to_owned();
        } else {
            self.summary = summary.chars().take(SUMMARY_MAX_CHARS).collect();
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_defaults() {
        let node = Node::new("run_1", "worker", "mock");
        assert!(node.id.starts_with("node_"));
        assert_eq!(node.status, NodeStatus::Idle);
        assert_eq!(node.connection.status, ConnectionStatus::Disconnected);
        assert_eq!(node.inbox_count, 0);
        assert!(!node.pending_turn);
    }

    #[test]
    fn summary_truncated_to_budget() {
        let mut node = Node::new("run_1", "n", "mock");
        node.set_summary(&"x".repeat(300));
        assert_eq!(node.summary.chars().count(), SUMMARY_MAX_CHARS);

        node.set_summary("short");
        assert_eq!(node.summary, "short");
    }

    #[test]
    fn edge_management_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(EdgeManagement::Self_).unwrap(),
            serde_json::json!("self")
        );
        assert_eq!(
            serde_json::to_value(EdgeManagement::All).unwrap(),
            serde_json::json!("all")
        );
    }

    #[test]
    fn session_reset_clears_everything() {
        let mut session = SessionState {
            id: Some("s1".into()),
            prompt_sent: true,
            header_hash: Some("abc".into()),
        };
        session.reset();
        assert_eq!(session, SessionState::default());
    }

    #[test]
    fn permissions_default_to_skip() {
        let p = Permissions::default();
        assert_eq!(p.cli_permissions_mode, CliPermissionsMode::Skip);
        assert!(!p.agent_management_requires_approval);
    }
}

//! Handoff envelopes and the per-node inbox model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopePayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    /// Artifact ids referenced by the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// The message carried along an edge. Immutable once created and
/// delivered exactly once to the target inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Wire discriminator, always `"handoff"`.
    #[serde(default = "handoff_kind")]
    pub kind: String,
    pub id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: EnvelopePayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
}

fn handoff_kind() -> String {
    "handoff".into()
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: EnvelopePayload) -> Self {
        Self {
            kind: handoff_kind(),
            id: id::new_id(id::ENVELOPE),
            from_node_id: from.into(),
            to_node_id: to.into(),
            created_at: Utc::now(),
            payload,
            context_ref: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbox items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One pending input for a node, consumed FIFO at turn start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboxItem {
    User {
        id: String,
        content: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    Handoff { envelope: Envelope },
}

impl InboxItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            id: id::new_id(id::MESSAGE),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User { id, .. } => id,
            Self::Handoff { envelope } => &envelope.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::User { created_at, .. } => *created_at,
            Self::Handoff { envelope } => envelope.created_at,
        }
    }
}

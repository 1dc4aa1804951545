//! Approval records — the user-in-the-loop gate for tool calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Approved,
    Denied,
    /// Approved with replacement arguments.
    Modified,
}

/// A pending approval. Blocks its node until resolved; its lifetime is
/// the node's lifetime (drained on node/run teardown).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub run_id: String,
    pub node_id: String,
    /// Tool name the approval gates.
    pub tool: String,
    /// Call arguments and any provider-supplied context.
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Optional deadline; elapsing without resolution auto-denies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        tool: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            approval_id: id::new_id(id::APPROVAL),
            run_id: run_id.into(),
            node_id: node_id.into(),
            tool: tool.into(),
            context,
            created_at: Utc::now(),
            deadline_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResolution {
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Replacement args when `status = modified`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_args: Option<serde_json::Value>,
}

impl ApprovalResolution {
    pub fn approved() -> Self {
        Self {
            status: ApprovalStatus::Approved,
            feedback: None,
            modified_args: None,
        }
    }

    pub fn denied(feedback: Option<String>) -> Self {
        Self {
            status: ApprovalStatus::Denied,
            feedback,
            modified_args: None,
        }
    }

    pub fn modified(args: serde_json::Value) -> Self {
        Self {
            status: ApprovalStatus::Modified,
            feedback: None,
            modified_args: Some(args),
        }
    }
}

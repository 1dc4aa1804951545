//! Shared domain types for the AgentGrid runtime.
//!
//! Everything that crosses a crate boundary lives here: runs, nodes,
//! edges, handoff envelopes, artifacts, approvals, the canonical event
//! union, tool calls, configuration, and the shared error type.

pub mod approval;
pub mod artifact;
pub mod config;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod event;
pub mod id;
pub mod node;
pub mod run;
pub mod tool;

pub use approval::{ApprovalRequest, ApprovalResolution, ApprovalStatus};
pub use artifact::{Artifact, ArtifactKind};
pub use edge::{Edge, EdgeType};
pub use envelope::{Envelope, EnvelopePayload, InboxItem};
pub use error::{Error, Result};
pub use event::{Event, EventKind, NodePatch, RunPatch, StallEvidence};
pub use node::{
    Capabilities, CliPermissionsMode, Connection, ConnectionStatus, EdgeManagement, Node,
    NodeStatus, Permissions, SessionState,
};
pub use run::{GlobalMode, OrchestrationMode, Run, RunStatus, UsageTotals};
pub use tool::{ToolCall, ToolName, ToolResult};

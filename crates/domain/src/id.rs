//! Prefixed identifiers.
//!
//! Every entity id is a v4 UUID (simple form) behind a short type
//! prefix, e.g. `run_9f3c…`, `node_07aa…`. The prefix makes log lines
//! and persisted files self-describing.

use uuid::Uuid;

pub const RUN: &str = "run";
pub const NODE: &str = "node";
pub const EDGE: &str = "edge";
pub const ENVELOPE: &str = "env";
pub const ARTIFACT: &str = "art";
pub const APPROVAL: &str = "apr";
pub const EVENT: &str = "evt";
pub const TURN: &str = "turn";
pub const MESSAGE: &str = "msg";
pub const CALL: &str = "call";

/// Generate a new prefixed identifier.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().as_simple())
}

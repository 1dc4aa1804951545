//! Edge records — directed authorization links between nodes.
//!
//! Edges permit handoffs; they never cause delivery by themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    #[default]
    Handoff,
    /// Delivered identically to `handoff`; a rendering hint for UIs.
    Report,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default, rename = "type")]
    pub edge_type: EdgeType,
    #[serde(default)]
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id::new_id(id::EDGE),
            from: from.into(),
            to: to.into(),
            bidirectional: false,
            edge_type: EdgeType::Handoff,
            label: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether this edge authorizes a handoff from `from` to `to`.
    pub fn permits(&self, from: &str, to: &str) -> bool {
        (self.from == from && self.to == to)
            || (self.bidirectional && self.from == to && self.to == from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directed_edge_permits_one_way() {
        let edge = Edge::new("a", "b");
        assert!(edge.permits("a", "b"));
        assert!(!edge.permits("b", "a"));
    }

    #[test]
    fn bidirectional_edge_permits_both_ways() {
        let mut edge = Edge::new("a", "b");
        edge.bidirectional = true;
        assert!(edge.permits("a", "b"));
        assert!(edge.permits("b", "a"));
        assert!(!edge.permits("a", "c"));
    }

    #[test]
    fn type_field_serializes_as_type() {
        let edge = Edge::new("a", "b");
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["type"], "handoff");
    }
}

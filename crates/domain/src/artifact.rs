//! Artifact records — immutable on-disk outputs of turns and tools.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Prompt,
    Diff,
    Transcript,
    Log,
    Report,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub kind: ArtifactKind,
    pub name: String,
    /// Absolute path of the stored content.
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Artifact {
    pub fn new(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        kind: ArtifactKind,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id::new_id(id::ARTIFACT),
            run_id: run_id.into(),
            node_id: node_id.into(),
            kind,
            name: name.into(),
            path: PathBuf::new(),
            created_at: Utc::now(),
            metadata: None,
        }
    }
}

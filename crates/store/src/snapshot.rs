//! Run snapshots.
//!
//! A snapshot is one JSON document holding the entire run state,
//! written atomically (temp sibling + rename). The run store debounces
//! writes with a per-run dirty counter; shutdown flushes synchronously.

use std::path::{Path, PathBuf};

use ag_domain::error::Result;

use crate::run_store::RunState;

pub const SNAPSHOT_FILE: &str = "state.json";

pub fn snapshot_path(data_dir: &Path, run_id: &str) -> PathBuf {
    data_dir.join("runs").join(run_id).join(SNAPSHOT_FILE)
}

/// Write the snapshot atomically.
pub fn write_snapshot(path: &Path, state: &RunState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot if one exists. A malformed snapshot is treated as
/// absent (the caller falls back to event-log replay) with a warning.
pub fn load_snapshot(path: &Path) -> Option<RunState> {
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<RunState>(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed snapshot; falling back to event replay");
                None
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable snapshot; falling back to event replay");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::{GlobalMode, OrchestrationMode, Run};
    use std::path::PathBuf;

    fn make_state() -> RunState {
        RunState::new(Run::new(
            PathBuf::from("/w"),
            OrchestrationMode::Auto,
            GlobalMode::Implementation,
        ))
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_state();
        let path = snapshot_path(dir.path(), &state.run.id);

        write_snapshot(&path, &state).unwrap();
        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded.run.id, state.run.id);
        assert_eq!(loaded.run.status, state.run.status);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshot(&dir.path().join("state.json")).is_none());
    }

    #[test]
    fn malformed_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_snapshot(&path).is_none());
    }
}

//! Crash recovery.
//!
//! On startup every `runs/<id>/` directory rehydrates: the snapshot
//! wins when present, otherwise the event log is folded left-to-right
//! (only patch-style events contribute). Either way the result is
//! normalized so a crashed run cannot resume unsupervised: `running`
//! runs demote to `paused`, in-flight nodes demote to `idle` and
//! `disconnected`, and inbox counts are recomputed from the persisted
//! queues.

use std::path::Path;

use ag_domain::{
    ConnectionStatus, Event, EventKind, InboxItem, NodeStatus, RunStatus,
};

use crate::event_log;
use crate::run_store::RunState;
use crate::snapshot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Folding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rebuild run state by folding events oldest-first. Returns `None`
/// when the log never created a run or ends in deletion.
pub fn fold_events(events: &[Event]) -> Option<RunState> {
    let mut state: Option<RunState> = None;

    for event in events {
        if !event.kind.contributes_to_rebuild() {
            continue;
        }
        match &event.kind {
            EventKind::RunCreated { run } => {
                state = Some(RunState::new(run.clone()));
            }
            EventKind::RunDeleted {} => {
                state = None;
            }
            _ => {
                let Some(st) = state.as_mut() else {
                    tracing::warn!(event_id = %event.id, "event precedes run.created; skipping");
                    continue;
                };
                apply_rebuild_event(st, &event.kind);
            }
        }
    }

    state
}

fn apply_rebuild_event(state: &mut RunState, kind: &EventKind) {
    match kind {
        EventKind::RunPatch { patch } => patch.apply(&mut state.run),
        EventKind::NodeCreated { node } => state.nodes.push(node.clone()),
        EventKind::NodePatch { node_id, patch } => {
            if let Some(node) = state.node_mut(node_id) {
                patch.apply(node);
            }
        }
        EventKind::NodeDeleted { node_id } => {
            state.remove_node(node_id);
        }
        EventKind::UserMessage {
            node_id,
            message_id,
            content,
        } => {
            let item = InboxItem::User {
                id: message_id.clone(),
                content: content.clone(),
                created_at: chrono::Utc::now(),
            };
            let _ = state.push_inbox(node_id, item);
        }
        EventKind::HandoffSent { envelope } => {
            let _ = state.push_inbox(
                &envelope.to_node_id,
                InboxItem::Handoff {
                    envelope: envelope.clone(),
                },
            );
        }
        EventKind::InboxConsumed { node_id, count } => {
            if let Some(queue) = state.inboxes.get_mut(node_id) {
                for _ in 0..*count {
                    queue.pop_front();
                }
                let len = queue.len();
                if let Some(node) = state.node_mut(node_id) {
                    node.inbox_count = len;
                }
            }
        }
        EventKind::EdgeCreated { edge } => state.edges.push(edge.clone()),
        EventKind::EdgeDeleted { edge_id } => state.edges.retain(|e| &e.id != edge_id),
        EventKind::ArtifactCreated { artifact } => state.artifacts.push(artifact.clone()),
        EventKind::ApprovalRequested { approval } => state.approvals.push(approval.clone()),
        EventKind::ApprovalResolved { approval_id, .. } => {
            state.approvals.retain(|a| &a.approval_id != approval_id)
        }
        // Handled by the caller / not patch-style.
        _ => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Demote whatever was mid-flight when the process died. Prevents a
/// recovered run from resuming turns nobody is supervising.
pub fn normalize_after_crash(state: &mut RunState) {
    if state.run.status == RunStatus::Running {
        state.run.status = RunStatus::Paused;
    }
    for node in &mut state.nodes {
        if matches!(node.status, NodeStatus::Running | NodeStatus::Blocked) {
            node.status = NodeStatus::Idle;
        }
        node.connection.status = ConnectionStatus::Disconnected;
    }
    // Recompute inbox counts from the persisted queues.
    let counts: Vec<(String, usize)> = state
        .inboxes
        .iter()
        .map(|(id, q)| (id.clone(), q.len()))
        .collect();
    for node in &mut state.nodes {
        node.inbox_count = 0;
    }
    for (node_id, count) in counts {
        if let Some(node) = state.node_mut(&node_id) {
            node.inbox_count = count;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Directory scan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rehydrate every run directory under `<dataDir>/runs`.
pub fn load_run_states(data_dir: &Path) -> Vec<RunState> {
    let runs_dir = data_dir.join("runs");
    let Ok(entries) = std::fs::read_dir(&runs_dir) else {
        return Vec::new();
    };

    let mut states = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }

        let snapshot_path = dir.join(snapshot::SNAPSHOT_FILE);
        let state = snapshot::load_snapshot(&snapshot_path).or_else(|| {
            let events = event_log::read_events(&dir.join("events.ndjson")).unwrap_or_default();
            fold_events(&events)
        });

        match state {
            Some(mut state) => {
                normalize_after_crash(&mut state);
                states.push(state);
            }
            None => {
                tracing::warn!(path = %dir.display(), "run directory has no recoverable state");
            }
        }
    }

    states.sort_by(|a, b| a.run.created_at.cmp(&b.run.created_at));
    states
}

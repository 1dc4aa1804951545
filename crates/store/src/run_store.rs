//! The authoritative run store.
//!
//! One entry per run: the mutable state behind a write lock, the
//! per-run event log, and snapshot dirty-tracking. Every mutation goes
//! through [`RunStore::update`], which applies the change, appends the
//! resulting events to the log, fans them out on the bus, and schedules
//! a debounced snapshot. Callers never mutate state outside the lock.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ag_domain::error::{Error, Result};
use ag_domain::{
    ApprovalRequest, Artifact, Edge, Event, EventKind, InboxItem, Node, Run, RunStatus,
};

use crate::bus::EventBus;
use crate::event_log::{EventLog, EventPage};
use crate::snapshot;

/// Quiet period before a dirty run is snapshotted.
pub const SNAPSHOT_DEBOUNCE: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a run owns. This is also the snapshot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run: Run,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Per-node FIFO of pending inputs, keyed by node id.
    #[serde(default)]
    pub inboxes: HashMap<String, VecDeque<InboxItem>>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRequest>,
}

impl RunState {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            nodes: Vec::new(),
            edges: Vec::new(),
            artifacts: Vec::new(),
            inboxes: HashMap::new(),
            approvals: Vec::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == node_id)
    }

    /// Resolve a node reference — an id or a run-scoped alias — to the
    /// node. Alias uniqueness (ids and aliases share one namespace)
    /// makes the resolution unambiguous.
    pub fn resolve_node_ref(&self, node_ref: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.id == node_ref)
            .or_else(|| self.nodes.iter().find(|n| n.alias.as_deref() == Some(node_ref)))
    }

    /// Whether `candidate` collides with any node id or alias in this
    /// run (excluding `exclude_node_id`, for self-updates).
    pub fn ref_taken(&self, candidate: &str, exclude_node_id: Option<&str>) -> bool {
        self.nodes.iter().any(|n| {
            if Some(n.id.as_str()) == exclude_node_id {
                return n.id == candidate;
            }
            n.id == candidate || n.alias.as_deref() == Some(candidate)
        })
    }

    /// Display name for provenance labels: alias if set, else id.
    pub fn node_display(&self, node_id: &str) -> String {
        match self.node(node_id) {
            Some(node) => node.alias.clone().unwrap_or_else(|| node.id.clone()),
            None => node_id.to_owned(),
        }
    }

    /// Any edge authorizing a handoff from `from` to `to`.
    pub fn edge_permitting(&self, from: &str, to: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.permits(from, to))
    }

    /// Append an inbox item, keeping the node's `inboxCount` mirror in
    /// sync.
    pub fn push_inbox(&mut self, node_id: &str, item: InboxItem) -> Result<()> {
        if self.node(node_id).is_none() {
            return Err(Error::not_found("node", node_id));
        }
        let queue = self.inboxes.entry(node_id.to_owned()).or_default();
        queue.push_back(item);
        let len = queue.len();
        if let Some(node) = self.node_mut(node_id) {
            node.inbox_count = len;
        }
        Ok(())
    }

    /// Take every pending inbox item (FIFO order) and zero the mirror.
    pub fn drain_inbox(&mut self, node_id: &str) -> Vec<InboxItem> {
        let items: Vec<InboxItem> = self
            .inboxes
            .get_mut(node_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default();
        if let Some(node) = self.node_mut(node_id) {
            node.inbox_count = 0;
        }
        items
    }

    pub fn inbox_len(&self, node_id: &str) -> usize {
        self.inboxes.get(node_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Total unconsumed inbox items across the run.
    pub fn total_inbox_items(&self) -> usize {
        self.inboxes.values().map(VecDeque::len).sum()
    }

    /// Remove a node and everything hanging off it. Returns the ids of
    /// edges removed alongside it.
    pub fn remove_node(&mut self, node_id: &str) -> Vec<String> {
        self.nodes.retain(|n| n.id != node_id);
        self.inboxes.remove(node_id);
        self.approvals.retain(|a| a.node_id != node_id);
        let (dropped, kept): (Vec<Edge>, Vec<Edge>) = self
            .edges
            .drain(..)
            .partition(|e| e.from == node_id || e.to == node_id);
        self.edges = kept;
        dropped.into_iter().map(|e| e.id).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunEntry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunEntry {
    state: RwLock<RunState>,
    log: EventLog,
    snapshot_path: PathBuf,
    /// Monotonic mutation counter; compared against `flushed` by the
    /// debounced snapshot task.
    dirty: AtomicU64,
    flushed: AtomicU64,
}

impl RunEntry {
    fn flush(&self) {
        let seen = self.dirty.load(Ordering::Acquire);
        if seen == self.flushed.load(Ordering::Acquire) {
            return;
        }
        let state = self.state.read().clone();
        if let Err(e) = snapshot::write_snapshot(&self.snapshot_path, &state) {
            tracing::warn!(
                path = %self.snapshot_path.display(),
                error = %e,
                "snapshot write failed"
            );
            return;
        }
        self.flushed.store(seen, Ordering::Release);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RunStore {
    data_dir: PathBuf,
    bus: Arc<EventBus>,
    runs: RwLock<HashMap<String, Arc<RunEntry>>>,
    debounce: Duration,
}

impl RunStore {
    pub fn new(data_dir: impl Into<PathBuf>, bus: Arc<EventBus>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bus,
            runs: RwLock::new(HashMap::new()),
            debounce: SNAPSHOT_DEBOUNCE,
        }
    }

    /// Shorten the snapshot debounce (tests).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id)
    }

    fn entry(&self, run_id: &str) -> Result<Arc<RunEntry>> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::not_found("run", run_id))
    }

    fn make_entry(&self, state: RunState) -> Arc<RunEntry> {
        let run_id = state.run.id.clone();
        Arc::new(RunEntry {
            log: EventLog::open(self.run_dir(&run_id).join("events.ndjson")),
            snapshot_path: snapshot::snapshot_path(&self.data_dir, &run_id),
            state: RwLock::new(state),
            dirty: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Register a new run and record its creation event.
    pub fn create_run(&self, run: Run) -> Result<Run> {
        let run_id = run.id.clone();
        std::fs::create_dir_all(self.run_dir(&run_id))?;

        let entry = self.make_entry(RunState::new(run.clone()));
        self.runs.write().insert(run_id.clone(), entry);

        self.update(&run_id, |_state| {
            Ok(((), vec![EventKind::RunCreated { run: run.clone() }]))
        })?;
        Ok(run)
    }

    /// Insert a rehydrated run without emitting events (recovery path:
    /// subscribers receive no synthetic backfill).
    pub fn insert_recovered(&self, state: RunState) {
        let run_id = state.run.id.clone();
        let entry = self.make_entry(state);
        self.runs.write().insert(run_id, entry);
    }

    /// Delete a run: record the deletion, drop the entry, and remove
    /// its directory.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        self.record(run_id, EventKind::RunDeleted {})?;
        self.runs.write().remove(run_id);
        self.bus.remove_run(run_id);
        let dir = self.run_dir(run_id);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove run directory");
        }
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.read().contains_key(run_id)
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.runs.read().keys().cloned().collect()
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        Ok(self.entry(run_id)?.state.read().run.clone())
    }

    pub fn list_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .values()
            .map(|e| e.state.read().run.clone())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        runs
    }

    /// Read a projection of the run state under the read lock.
    pub fn read<R>(&self, run_id: &str, f: impl FnOnce(&RunState) -> R) -> Result<R> {
        let entry = self.entry(run_id)?;
        let state = entry.state.read();
        Ok(f(&state))
    }

    /// Clone the full run state (snapshot document).
    pub fn state_of(&self, run_id: &str) -> Result<RunState> {
        self.read(run_id, RunState::clone)
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Apply a mutation under the run's write guard. The closure
    /// returns the events describing the change; each is appended to
    /// the log and fanned out on the bus before the guard drops, so
    /// per-run event order matches mutation order.
    pub fn update<R>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunState) -> Result<(R, Vec<EventKind>)>,
    ) -> Result<R> {
        let entry = self.entry(run_id)?;
        let result = {
            let mut state = entry.state.write();
            let (result, kinds) = f(&mut state)?;
            for kind in kinds {
                let event = Event::new(run_id, kind);
                if let Err(e) = entry.log.append(&event) {
                    // Persistent log failure: demote the run to paused
                    // rather than keep mutating unrecorded state.
                    tracing::error!(run_id, error = %e, "event log unavailable; pausing run");
                    state.run.status = RunStatus::Paused;
                }
                self.bus.publish(&event);
            }
            result
        };
        self.mark_dirty(&entry);
        Ok(result)
    }

    /// Record an event that carries no state change (streaming deltas,
    /// console chunks, tool progress). Appends + publishes, no
    /// snapshot scheduling.
    pub fn record(&self, run_id: &str, kind: EventKind) -> Result<()> {
        let entry = self.entry(run_id)?;
        let event = Event::new(run_id, kind);
        entry.log.append(&event)?;
        self.bus.publish(&event);
        Ok(())
    }

    // ── Event log access ─────────────────────────────────────────────

    pub fn events_page(
        &self,
        run_id: &str,
        before: Option<u64>,
        limit: usize,
    ) -> Result<EventPage> {
        self.entry(run_id)?.log.read_before(before, limit)
    }

    pub fn events_all(&self, run_id: &str) -> Result<Vec<Event>> {
        self.entry(run_id)?.log.read_all()
    }

    // ── Snapshots ────────────────────────────────────────────────────

    fn mark_dirty(&self, entry: &Arc<RunEntry>) {
        let seen = entry.dirty.fetch_add(1, Ordering::AcqRel) + 1;

        // Debounce: write only if no further mutation lands within the
        // quiet period. Outside a tokio runtime (sync tests), flush
        // immediately.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let entry = entry.clone();
                let debounce = self.debounce;
                handle.spawn(async move {
                    tokio::time::sleep(debounce).await;
                    if entry.dirty.load(Ordering::Acquire) == seen {
                        entry.flush();
                    }
                });
            }
            Err(_) => entry.flush(),
        }
    }

    /// Synchronously flush every dirty run and fsync the logs
    /// (shutdown path).
    pub fn flush_all(&self) {
        let entries: Vec<Arc<RunEntry>> = self.runs.read().values().cloned().collect();
        for entry in entries {
            entry.flush();
            entry.log.sync();
        }
    }

    /// Flush one run's snapshot immediately.
    pub fn flush_run(&self, run_id: &str) -> Result<()> {
        let entry = self.entry(run_id)?;
        entry.flush();
        entry.log.sync();
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::{Envelope, GlobalMode, NodePatch, OrchestrationMode, RunPatch};

    fn make_store(dir: &std::path::Path) -> RunStore {
        RunStore::new(dir, Arc::new(EventBus::new()))
    }

    fn make_run() -> Run {
        Run::new(
            PathBuf::from("/w"),
            OrchestrationMode::Interactive,
            GlobalMode::Implementation,
        )
    }

    #[test]
    fn create_run_records_creation_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        let run = store.create_run(make_run()).unwrap();

        let events = store.events_all(&run.id).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, EventKind::RunCreated { .. }));
        assert!(store.contains(&run.id));
    }

    #[test]
    fn update_appends_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        let run = store.create_run(make_run()).unwrap();

        let node = Node::new(&run.id, "worker", "mock");
        let node_id = node.id.clone();
        store
            .update(&run.id, |state| {
                state.nodes.push(node.clone());
                Ok(((), vec![EventKind::NodeCreated { node: node.clone() }]))
            })
            .unwrap();
        store
            .update(&run.id, |state| {
                let patch = NodePatch::status(ag_domain::NodeStatus::Running);
                patch.apply(state.node_mut(&node_id).unwrap());
                Ok((
                    (),
                    vec![EventKind::NodePatch {
                        node_id: node_id.clone(),
                        patch,
                    }],
                ))
            })
            .unwrap();

        let events = store.events_all(&run.id).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1].kind, EventKind::NodeCreated { .. }));
        assert!(matches!(events[2].kind, EventKind::NodePatch { .. }));
    }

    #[test]
    fn inbox_push_and_drain_keep_count_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        let run = store.create_run(make_run()).unwrap();
        let node = Node::new(&run.id, "a", "mock");
        let node_id = node.id.clone();

        store
            .update(&run.id, |state| {
                state.nodes.push(node.clone());
                state.push_inbox(&node_id, InboxItem::user("one"))?;
                state.push_inbox(&node_id, InboxItem::user("two"))?;
                Ok(((), vec![]))
            })
            .unwrap();

        store
            .read(&run.id, |state| {
                assert_eq!(state.node(&node_id).unwrap().inbox_count, 2);
                assert_eq!(state.total_inbox_items(), 2);
            })
            .unwrap();

        let drained = store
            .update(&run.id, |state| Ok((state.drain_inbox(&node_id), vec![])))
            .unwrap();
        assert_eq!(drained.len(), 2);
        match &drained[0] {
            InboxItem::User { content, .. } => assert_eq!(content, "one"),
            other => panic!("unexpected item: {other:?}"),
        }

        store
            .read(&run.id, |state| {
                assert_eq!(state.node(&node_id).unwrap().inbox_count, 0);
                assert_eq!(state.total_inbox_items(), 0);
            })
            .unwrap();
    }

    #[test]
    fn push_inbox_unknown_node_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        let run = store.create_run(make_run()).unwrap();

        let err = store
            .update(&run.id, |state| {
                state.push_inbox("node_ghost", InboxItem::user("x"))?;
                Ok(((), vec![]))
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn resolve_node_ref_by_id_and_alias() {
        let mut state = RunState::new(make_run());
        let mut node = Node::new(&state.run.id, "a", "mock");
        node.alias = Some("verifier".into());
        let node_id = node.id.clone();
        state.nodes.push(node);

        assert_eq!(state.resolve_node_ref(&node_id).unwrap().id, node_id);
        assert_eq!(state.resolve_node_ref("verifier").unwrap().id, node_id);
        assert!(state.resolve_node_ref("ghost").is_none());
    }

    #[test]
    fn ref_taken_covers_ids_and_aliases() {
        let mut state = RunState::new(make_run());
        let mut node = Node::new(&state.run.id, "a", "mock");
        node.alias = Some("builder".into());
        let node_id = node.id.clone();
        state.nodes.push(node);

        assert!(state.ref_taken(&node_id, None));
        assert!(state.ref_taken("builder", None));
        assert!(!state.ref_taken("fresh", None));
        // A node may keep its own alias on update.
        assert!(!state.ref_taken("builder", Some(&node_id)));
    }

    #[test]
    fn remove_node_drops_edges_and_inbox() {
        let mut state = RunState::new(make_run());
        let a = Node::new(&state.run.id, "a", "mock");
        let b = Node::new(&state.run.id, "b", "mock");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        state.nodes.push(a);
        state.nodes.push(b);
        state.edges.push(Edge::new(&a_id, &b_id));
        state.push_inbox(&a_id, InboxItem::user("x")).unwrap();

        let dropped = state.remove_node(&a_id);
        assert_eq!(dropped.len(), 1);
        assert!(state.node(&a_id).is_none());
        assert!(state.edges.is_empty());
        assert_eq!(state.inbox_len(&a_id), 0);
    }

    #[test]
    fn snapshot_written_after_update_without_runtime() {
        // Outside a tokio runtime mark_dirty flushes synchronously.
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        let run = store.create_run(make_run()).unwrap();

        let path = snapshot::snapshot_path(store.data_dir(), &run.id);
        assert!(path.exists());
        let loaded = snapshot::load_snapshot(&path).unwrap();
        assert_eq!(loaded.run.id, run.id);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_debounce_coalesces_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path()).with_debounce(Duration::from_millis(50));
        let run = store.create_run(make_run()).unwrap();
        let path = snapshot::snapshot_path(store.data_dir(), &run.id);

        for _ in 0..3 {
            store
                .update(&run.id, |state| {
                    let patch = RunPatch::status(RunStatus::Paused);
                    patch.apply(&mut state.run);
                    Ok(((), vec![EventKind::RunPatch { patch }]))
                })
                .unwrap();
        }
        // Nothing written during the quiet period...
        assert!(!path.exists());

        // ...and exactly the latest state lands after it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let loaded = snapshot::load_snapshot(&path).unwrap();
        assert_eq!(loaded.run.status, RunStatus::Paused);
    }

    #[test]
    fn flush_all_writes_pending_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        let run = store.create_run(make_run()).unwrap();

        store
            .update(&run.id, |state| {
                let patch = RunPatch::status(RunStatus::Stopped);
                patch.apply(&mut state.run);
                Ok(((), vec![EventKind::RunPatch { patch }]))
            })
            .unwrap();
        store.flush_all();

        let path = snapshot::snapshot_path(store.data_dir(), &run.id);
        let loaded = snapshot::load_snapshot(&path).unwrap();
        assert_eq!(loaded.run.status, RunStatus::Stopped);
    }

    #[test]
    fn delete_run_removes_entry_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        let run = store.create_run(make_run()).unwrap();
        let run_dir = dir.path().join("runs").join(&run.id);
        assert!(run_dir.exists());

        store.delete_run(&run.id).unwrap();
        assert!(!store.contains(&run.id));
        assert!(!run_dir.exists());
        assert!(store.get_run(&run.id).is_err());
    }

    #[tokio::test]
    async fn update_events_reach_the_bus() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let store = RunStore::new(dir.path(), bus.clone());
        let mut rx = bus.subscribe();

        let run = store.create_run(make_run()).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id, run.id);
        assert!(matches!(event.kind, EventKind::RunCreated { .. }));
    }

    #[test]
    fn handoff_envelope_flows_through_inbox() {
        let mut state = RunState::new(make_run());
        let a = Node::new(&state.run.id, "a", "mock");
        let b = Node::new(&state.run.id, "b", "mock");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        state.nodes.push(a);
        state.nodes.push(b);

        let envelope = Envelope::new(
            &a_id,
            &b_id,
            ag_domain::EnvelopePayload {
                message: "please verify".into(),
                ..Default::default()
            },
        );
        state
            .push_inbox(&b_id, InboxItem::Handoff { envelope })
            .unwrap();
        assert_eq!(state.node(&b_id).unwrap().inbox_count, 1);
    }
}

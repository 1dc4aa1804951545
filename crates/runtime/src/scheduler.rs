//! The per-run scheduler.
//!
//! One loop per run. Each pass selects ready nodes — idle, with inbox
//! items or a pending turn, FIFO by last activity — and spawns turns up
//! to the concurrency cap. Auto mode synthesizes continue ticks for
//! idle nodes until `maxIterations` completes the run. The loop parks
//! on its run's event stream plus an explicit wake handle, with a slow
//! poll as a safety net.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use ag_domain::config::Config;
use ag_domain::{EventKind, NodeStatus, OrchestrationMode, RunPatch, RunStatus};
use ag_store::RunState;

use crate::runner::{run_turn, RunnerDeps};

const IDLE_POLL: Duration = Duration::from_millis(500);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ready-set selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    pub node_id: String,
    pub continue_tick: bool,
}

/// Pick the nodes to run this pass. Pure: takes the state snapshot,
/// the in-flight set, and the free slot count.
pub fn select_ready(
    state: &RunState,
    config: &Config,
    in_flight: &HashSet<String>,
    free_slots: usize,
) -> Vec<Selected> {
    if state.run.status != RunStatus::Running || free_slots == 0 {
        return Vec::new();
    }

    let auto = state.run.mode == OrchestrationMode::Auto;
    let max_iterations = config.orchestration.max_iterations;
    let max_turns_per_node = config.orchestration.max_turns_per_node;
    let iterations_left = auto && state.run.total_turns < max_iterations;

    let mut candidates: Vec<(&ag_domain::Node, bool)> = state
        .nodes
        .iter()
        .filter(|node| node.status == NodeStatus::Idle && !in_flight.contains(&node.id))
        .filter_map(|node| {
            let has_input = node.inbox_count > 0 || node.pending_turn;
            if has_input {
                return Some((node, false));
            }
            // Auto mode keeps idle nodes moving with continue ticks,
            // within the per-node and per-run budgets.
            let node_budget_left =
                max_turns_per_node == 0 || node.completed_turns < max_turns_per_node;
            if iterations_left && node_budget_left {
                return Some((node, true));
            }
            None
        })
        .collect();

    // Strict FIFO on last activity, ties broken by node id.
    candidates.sort_by(|(a, _), (b, _)| {
        a.last_activity_at
            .cmp(&b.last_activity_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    candidates
        .into_iter()
        .take(free_slots)
        .map(|(node, continue_tick)| Selected {
            node_id: node.id.clone(),
            continue_tick,
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunLoop {
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    deps: Arc<RunnerDeps>,
    loops: Mutex<HashMap<String, RunLoop>>,
}

impl Scheduler {
    pub fn new(deps: Arc<RunnerDeps>) -> Self {
        Self {
            deps,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Bring up the scheduling loop for a run (idempotent).
    pub fn start(&self, run_id: &str) {
        let mut loops = self.loops.lock();
        if loops.contains_key(run_id) {
            return;
        }
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(run_loop(
            self.deps.clone(),
            run_id.to_owned(),
            wake.clone(),
        ));
        loops.insert(run_id.to_owned(), RunLoop { wake, handle });
    }

    /// Nudge a run's loop (new input, resume, config change).
    pub fn wake(&self, run_id: &str) {
        if let Some(run_loop) = self.loops.lock().get(run_id) {
            run_loop.wake.notify_one();
        }
    }

    /// Tear down a run's loop.
    pub fn stop(&self, run_id: &str) {
        if let Some(run_loop) = self.loops.lock().remove(run_id) {
            run_loop.handle.abort();
        }
    }

    pub fn shutdown(&self) {
        let mut loops = self.loops.lock();
        for (_, run_loop) in loops.drain() {
            run_loop.handle.abort();
        }
    }
}

async fn run_loop(deps: Arc<RunnerDeps>, run_id: String, wake: Arc<Notify>) {
    tracing::debug!(run_id, "scheduler loop started");
    let mut events = deps.store.bus().subscribe_run(&run_id);
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let active = Arc::new(AtomicUsize::new(0));

    loop {
        let Ok(run) = deps.store.get_run(&run_id) else {
            break; // deleted
        };
        if run.status.is_terminal() {
            break;
        }

        if run.status == RunStatus::Running {
            // Auto-mode budget: once the run has spent its iterations
            // and the last turns land, complete it.
            if run.mode == OrchestrationMode::Auto
                && run.total_turns >= deps.config.orchestration.max_iterations
                && active.load(Ordering::Acquire) == 0
            {
                tracing::info!(run_id, turns = run.total_turns, "iteration budget reached; completing run");
                let _ = deps.store.update(&run_id, |state| {
                    let patch = RunPatch::status(RunStatus::Completed);
                    patch.apply(&mut state.run);
                    Ok(((), vec![EventKind::RunPatch { patch }]))
                });
                break;
            }

            let free_slots = deps
                .config
                .scheduler
                .max_concurrency
                .saturating_sub(active.load(Ordering::Acquire));
            let selected = {
                let in_flight_guard = in_flight.lock();
                match deps.store.read(&run_id, |state| {
                    select_ready(state, &deps.config, &in_flight_guard, free_slots)
                }) {
                    Ok(selected) => selected,
                    Err(_) => break,
                }
            };

            for pick in selected {
                in_flight.lock().insert(pick.node_id.clone());
                active.fetch_add(1, Ordering::AcqRel);

                let deps = deps.clone();
                let run_id = run_id.clone();
                let in_flight = in_flight.clone();
                let active = active.clone();
                let wake = wake.clone();
                tokio::spawn(async move {
                    let outcome =
                        run_turn(&deps, &run_id, &pick.node_id, pick.continue_tick).await;
                    if let Err(e) = outcome {
                        tracing::warn!(
                            run_id,
                            node_id = %pick.node_id,
                            error = %e,
                            "turn aborted before completion"
                        );
                        // The turn died before its own cleanup (e.g.
                        // the provider is unknown). Park the node as
                        // failed; new input or a node update revives
                        // it.
                        let _ = deps.store.update(&run_id, |state| {
                            let patch = ag_domain::NodePatch::status(NodeStatus::Failed);
                            if let Some(node) = state.node_mut(&pick.node_id) {
                                patch.apply(node);
                            }
                            Ok((
                                (),
                                vec![
                                    EventKind::NodeProgress {
                                        node_id: pick.node_id.clone(),
                                        summary: format!("turn aborted: {e}"),
                                    },
                                    EventKind::NodePatch {
                                        node_id: pick.node_id.clone(),
                                        patch,
                                    },
                                ],
                            ))
                        });
                    }
                    in_flight.lock().remove(&pick.node_id);
                    active.fetch_sub(1, Ordering::AcqRel);
                    wake.notify_one();
                });
            }
        }

        // Park until something changes: a run event, an explicit wake,
        // or the safety-net poll.
        tokio::select! {
            _ = wake.notified() => {}
            result = events.recv() => {
                if matches!(result, Err(tokio::sync::broadcast::error::RecvError::Closed)) {
                    // Run deleted; channel gone.
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
            _ = tokio::time::sleep(IDLE_POLL) => {}
        }
    }
    tracing::debug!(run_id, "scheduler loop ended");
}

//! Event fan-out.
//!
//! A global broadcast channel plus one channel per run. Subscribers
//! that fall behind lose events (`broadcast` lag) — the event log is
//! the authoritative record, so observers resync via paginated fetch.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use ag_domain::Event;

const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    global: broadcast::Sender<Event>,
    per_run: RwLock<HashMap<String, broadcast::Sender<Event>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            global: broadcast::channel(CHANNEL_CAPACITY).0,
            per_run: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to every event across all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.global.subscribe()
    }

    /// Subscribe to one run's events.
    pub fn subscribe_run(&self, run_id: &str) -> broadcast::Receiver<Event> {
        let mut channels = self.per_run.write();
        channels
            .entry(run_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fan an event out to the global channel and the run's channel.
    /// Send failures mean "no subscribers" and are ignored.
    pub fn publish(&self, event: &Event) {
        let _ = self.global.send(event.clone());
        if let Some(tx) = self.per_run.read().get(&event.run_id) {
            let _ = tx.send(event.clone());
        }
    }

    /// Drop the per-run channel when a run is deleted.
    pub fn remove_run(&self, run_id: &str) {
        self.per_run.write().remove(run_id);
    }
}

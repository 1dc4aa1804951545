//! Durable state for the AgentGrid runtime.
//!
//! The run store is the single mutable authority over runs, nodes,
//! edges, inboxes, artifacts, and approvals. Every mutation emits an
//! event on the bus, appends it to the per-run NDJSON log, and
//! schedules a debounced snapshot. On startup, runs rehydrate from the
//! snapshot or, failing that, by folding the event log.

pub mod artifacts;
pub mod bus;
pub mod event_log;
pub mod recovery;
pub mod run_store;
pub mod snapshot;

pub use artifacts::ArtifactStore;
pub use bus::EventBus;
pub use event_log::{EventLog, EventPage};
pub use run_store::{RunState, RunStore};

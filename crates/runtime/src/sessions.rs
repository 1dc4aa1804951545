//! Per-node adapter sessions.
//!
//! The node runner exclusively owns its adapter session. Sessions are
//! created lazily on the first turn, reset on provider switch or
//! explicit reset, and disposed on node/run deletion. Each session
//! bundles the adapter, the receiving half of its event channel, a
//! cooperative cancel flag, and the bounded transcript tail used for
//! replay fallback.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ag_domain::error::Result;
use ag_providers::{AdapterEvent, ProviderAdapter, ProviderRegistry};

use crate::prompt::TranscriptEntry;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cooperative cancellation for the in-flight turn.
#[derive(Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

pub struct NodeSession {
    pub provider: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Taken by the runner for the duration of a turn.
    pub events: Mutex<Option<mpsc::Receiver<AdapterEvent>>>,
    pub cancel: CancelFlag,
    /// Last `replayTurns × 2` transcript entries.
    pub transcript: Mutex<VecDeque<TranscriptEntry>>,
}

impl NodeSession {
    /// Append transcript entries, trimming to the replay window.
    pub fn push_transcript(&self, entries: Vec<TranscriptEntry>) {
        let limit = self.adapter.replay_turns().saturating_mul(2);
        let mut transcript = self.transcript.lock();
        transcript.extend(entries);
        while transcript.len() > limit {
            transcript.pop_front();
        }
    }

    pub fn transcript_tail(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().iter().cloned().collect()
    }
}

/// Registry of live sessions, keyed by node id.
#[derive(Default)]
pub struct NodeSessions {
    sessions: Mutex<HashMap<String, Arc<NodeSession>>>,
}

impl NodeSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<NodeSession>> {
        self.sessions.lock().get(node_id).cloned()
    }

    /// Fetch the session for a node, building the adapter lazily. A
    /// provider mismatch replaces the entry with a fresh session (the
    /// façade closes the old adapter before switching providers).
    pub fn get_or_create(
        &self,
        node_id: &str,
        provider: &str,
        registry: &ProviderRegistry,
    ) -> Result<Arc<NodeSession>> {
        if let Some(existing) = self.get(node_id) {
            if existing.provider == provider {
                return Ok(existing);
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let adapter = registry.build(provider, tx)?;
        let session = Arc::new(NodeSession {
            provider: provider.to_owned(),
            adapter,
            events: Mutex::new(Some(rx)),
            cancel: CancelFlag::default(),
            transcript: Mutex::new(VecDeque::new()),
        });
        self.sessions
            .lock()
            .insert(node_id.to_owned(), session.clone());
        Ok(session)
    }

    /// Drop a node's session, closing the adapter.
    pub async fn remove(&self, node_id: &str) {
        let session = self.sessions.lock().remove(node_id);
        if let Some(session) = session {
            session.cancel.cancel();
            session.adapter.close().await;
        }
    }

    pub async fn remove_all(&self) {
        let all: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for node_id in all {
            self.remove(&node_id).await;
        }
    }

    /// Interrupt a node's in-flight turn (idempotent, cooperative).
    pub async fn interrupt(&self, node_id: &str) {
        if let Some(session) = self.get(node_id) {
            session.cancel.cancel();
            session.adapter.interrupt().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazy_creation_and_reuse() {
        let sessions = NodeSessions::new();
        let registry = ProviderRegistry::empty();

        assert!(sessions.get("node_1").is_none());
        let a = sessions.get_or_create("node_1", "mock", &registry).unwrap();
        let b = sessions.get_or_create("node_1", "mock", &registry).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn provider_switch_builds_a_fresh_session() {
        let sessions = NodeSessions::new();
        let registry = ProviderRegistry::empty();

        let old = sessions.get_or_create("node_1", "mock", &registry).unwrap();
        let new = sessions.get_or_create("node_1", "mock2", &registry).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.provider, "mock2");
    }

    #[tokio::test]
    async fn unknown_provider_fails() {
        let sessions = NodeSessions::new();
        let registry = ProviderRegistry::empty();
        assert!(sessions.get_or_create("n", "claude", &registry).is_err());
    }

    #[tokio::test]
    async fn remove_cancels_and_drops() {
        let sessions = NodeSessions::new();
        let registry = ProviderRegistry::empty();
        let session = sessions.get_or_create("node_1", "mock", &registry).unwrap();

        sessions.remove("node_1").await;
        assert!(session.cancel.is_cancelled());
        assert!(sessions.get("node_1").is_none());
    }

    #[test]
    fn transcript_tail_is_bounded() {
        let sessions = NodeSessions::new();
        let registry = ProviderRegistry::empty();
        // Mock default replay_turns = 3 → window of 6 entries.
        let session = sessions.get_or_create("node_1", "mock", &registry).unwrap();

        for n in 0..10 {
            session.push_transcript(vec![TranscriptEntry {
                role: "user".into(),
                text: format!("m{n}"),
            }]);
        }
        let tail = session.transcript_tail();
        assert_eq!(tail.len(), 6);
        assert_eq!(tail.first().unwrap().text, "m4");
        assert_eq!(tail.last().unwrap().text, "m9");
    }

    #[test]
    fn cancel_flag_clears() {
        let flag = CancelFlag::default();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
        flag.clear();
        assert!(!flag.is_cancelled());
    }
}

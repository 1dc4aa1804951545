//! Pending approvals — the human gate for tool calls.
//!
//! Every suspended tool call parks here with a `oneshot` sender; the
//! resolving API call unblocks it. Approvals raised by a provider's
//! own permission flow ("native") are tracked too, routed back to the
//! adapter instead of a waiting executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use ag_domain::error::{Error, Result};
use ag_domain::{ApprovalRequest, ApprovalResolution};
use ag_providers::ProviderAdapter;

enum Pending {
    /// An executor is parked on the receiver half.
    Gate(oneshot::Sender<ApprovalResolution>),
    /// The provider raised it; resolution is forwarded to the adapter.
    Native(Arc<dyn ProviderAdapter>),
}

/// Where a resolution went, so the caller knows who emits the
/// `approval.resolved` event (gate resolutions are emitted by the
/// waiting executor; native ones by the façade).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Gate,
    Native,
}

#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, Pending>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a tool call behind `request`. The returned receiver
    /// resolves when a human (or the deadline) decides.
    pub fn insert(&self, request: &ApprovalRequest) -> oneshot::Receiver<ApprovalResolution> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(request.approval_id.clone(), Pending::Gate(tx));
        rx
    }

    /// Track a provider-native approval.
    pub fn insert_native(&self, approval_id: &str, adapter: Arc<dyn ProviderAdapter>) {
        self.pending
            .lock()
            .insert(approval_id.to_owned(), Pending::Native(adapter));
    }

    /// Resolve a pending approval.
    pub async fn resolve(&self, approval_id: &str, resolution: ApprovalResolution) -> Result<Routed> {
        let pending = self
            .pending
            .lock()
            .remove(approval_id)
            .ok_or_else(|| Error::not_found("approval", approval_id))?;

        match pending {
            Pending::Gate(tx) => {
                // A dropped receiver means the turn was torn down; the
                // resolution is moot but not an error.
                let _ = tx.send(resolution);
                Ok(Routed::Gate)
            }
            Pending::Native(adapter) => {
                adapter.resolve_approval(approval_id, &resolution).await?;
                Ok(Routed::Native)
            }
        }
    }

    pub fn is_pending(&self, approval_id: &str) -> bool {
        self.pending.lock().contains_key(approval_id)
    }

    /// Auto-deny everything still pending for the given approvals
    /// (node teardown, run stop). Returns the ids actually drained.
    pub fn drain(&self, approval_ids: &[String]) -> Vec<String> {
        let mut pending = self.pending.lock();
        let mut drained = Vec::new();
        for id in approval_ids {
            if let Some(entry) = pending.remove(id) {
                if let Pending::Gate(tx) = entry {
                    let _ = tx.send(ApprovalResolution::denied(Some(
                        "cancelled: node or run shut down".into(),
                    )));
                }
                drained.push(id.clone());
            }
        }
        drained
    }

    /// Remove an entry without resolving (deadline cleanup).
    pub fn remove(&self, approval_id: &str) {
        self.pending.lock().remove(approval_id);
    }
}

/// Wait for a resolution, auto-denying when the optional deadline
/// elapses first.
pub async fn await_resolution(
    gate: &ApprovalGate,
    approval_id: &str,
    rx: oneshot::Receiver<ApprovalResolution>,
    deadline: Option<Duration>,
) -> ApprovalResolution {
    match deadline {
        None => rx.await.unwrap_or_else(|_| {
            ApprovalResolution::denied(Some("approval channel closed".into()))
        }),
        Some(timeout) => match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => ApprovalResolution::denied(Some("approval channel closed".into())),
            Err(_) => {
                gate.remove(approval_id);
                ApprovalResolution::denied(Some("approval deadline elapsed".into()))
            }
        },
    }
}

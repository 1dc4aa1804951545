//! The public runtime surface.
//!
//! Everything an external transport (HTTP/WebSocket, CLI) calls goes
//! through [`Runtime`]: run and node lifecycle, edges, chat, approvals,
//! artifacts, events, and role templates. The façade owns recovery at
//! startup and the snapshot flush at shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use ag_domain::config::Config;
use ag_domain::error::{Error, Result};
use ag_domain::{
    ApprovalRequest, ApprovalResolution, Artifact, ArtifactKind, Capabilities, Connection,
    ConnectionStatus, Edge, EdgeType, Envelope, Event, EventKind, GlobalMode, InboxItem, Node,
    NodePatch, OrchestrationMode, Permissions, Run, RunPatch, RunStatus,
};
use ag_providers::ProviderRegistry;
use ag_store::event_log::EventPage;
use ag_store::{recovery, ArtifactStore, EventBus, RunStore};
use ag_tools::CommandSecurity;

use crate::approvals::{ApprovalGate, Routed};
use crate::executor::ToolExecutor;
use crate::runner::RunnerDeps;
use crate::scheduler::Scheduler;
use crate::sessions::NodeSessions;
use crate::stall::StallDetector;
use crate::templates::TemplateStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request parameter types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunParams {
    pub working_dir: PathBuf,
    #[serde(default)]
    pub mode: Option<OrchestrationMode>,
    #[serde(default)]
    pub global_mode: Option<GlobalMode>,
    #[serde(default)]
    pub layout: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRunParams {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub mode: Option<OrchestrationMode>,
    #[serde(default)]
    pub global_mode: Option<GlobalMode>,
    #[serde(default)]
    pub layout: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeParams {
    pub label: String,
    pub provider: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeParams {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEdgeParams {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default, rename = "type")]
    pub edge_type: EdgeType,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageParams {
    pub content: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub interrupt: bool,
}

/// Non-hidden entry from the sandboxed directory listing.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub is_dir: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Runtime {
    config: Arc<Config>,
    deps: Arc<RunnerDeps>,
    scheduler: Scheduler,
    templates: Arc<TemplateStore>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(RunStore::new(&config.data_dir, bus.clone()));
        let artifacts = Arc::new(ArtifactStore::new(&config.data_dir));
        let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
        let approvals = Arc::new(ApprovalGate::new());
        let sessions = Arc::new(NodeSessions::new());
        let stall = Arc::new(StallDetector::new(config.stall_detection.threshold));
        let security = Arc::new(CommandSecurity::from_config(&config.tools.exec)?);
        let templates = Arc::new(TemplateStore::new(
            PathBuf::from("./templates"),
            config.data_dir.join("templates"),
        ));

        let executor = ToolExecutor::new(
            config.clone(),
            store.clone(),
            approvals.clone(),
            security.clone(),
        );
        let deps = Arc::new(RunnerDeps {
            config: config.clone(),
            store,
            artifacts,
            registry,
            approvals,
            sessions,
            stall,
            templates: templates.clone(),
            security,
            executor,
        });

        Ok(Self {
            config,
            scheduler: Scheduler::new(deps.clone()),
            deps,
            templates,
        })
    }

    /// Rehydrate persisted runs. Crashed runs come back `paused` with
    /// idle, disconnected nodes; subscribers receive no synthetic
    /// backfill.
    pub fn recover(&self) -> usize {
        let states = recovery::load_run_states(&self.config.data_dir);
        let count = states.len();
        for state in states {
            let run_id = state.run.id.clone();
            let terminal = state.run.status.is_terminal();
            self.deps.store.insert_recovered(state);
            if !terminal {
                self.scheduler.start(&run_id);
            }
        }
        if count > 0 {
            tracing::info!(runs = count, "recovered persisted runs");
        }
        count
    }

    /// Flush everything and stop. Pending snapshots are written before
    /// returning.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.deps.sessions.remove_all().await;
        self.deps.store.flush_all();
        tracing::info!("runtime shut down");
    }

    // ── Runs ─────────────────────────────────────────────────────────

    pub fn create_run(&self, params: CreateRunParams) -> Result<Run> {
        if !params.working_dir.is_dir() {
            return Err(Error::Validation(format!(
                "working directory '{}' does not exist",
                params.working_dir.display()
            )));
        }
        let mode = params
            .mode
            .unwrap_or(self.config.orchestration.default_run_mode);
        let global_mode = params
            .global_mode
            .unwrap_or(self.config.orchestration.default_global_mode);
        let mut run = Run::new(params.working_dir, mode, global_mode);
        run.layout = params.layout;

        let run = self.deps.store.create_run(run)?;
        self.scheduler.start(&run.id);
        Ok(run)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        self.deps.store.get_run(run_id)
    }

    pub fn list_runs(&self) -> Vec<Run> {
        self.deps.store.list_runs()
    }

    pub async fn update_run(&self, run_id: &str, params: UpdateRunParams) -> Result<Run> {
        let current = self.deps.store.get_run(run_id)?;
        if current.status.is_terminal() && params.status.is_some() {
            return Err(Error::Validation(format!(
                "run is {:?} and cannot change status",
                current.status
            )));
        }

        if params.status == Some(RunStatus::Stopped) {
            self.stop_run(run_id).await?;
        } else {
            // A resume clears the stall counters so the run gets a
            // fresh window.
            if params.status == Some(RunStatus::Running) && current.status == RunStatus::Paused {
                let node_ids =
                    self.deps.store.read(run_id, |state| {
                        state.nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>()
                    })?;
                self.deps.stall.reset_nodes(&node_ids);
            }

            let patch = RunPatch {
                status: params.status,
                mode: params.mode,
                global_mode: params.global_mode,
                layout: params.layout,
                ..Default::default()
            };
            self.deps.store.update(run_id, |state| {
                patch.apply(&mut state.run);
                Ok(((), vec![EventKind::RunPatch { patch: patch.clone() }]))
            })?;
        }

        self.scheduler.start(run_id);
        self.scheduler.wake(run_id);
        self.deps.store.get_run(run_id)
    }

    /// Interrupt every node, mark the run stopped, drain its pending
    /// approvals.
    pub async fn stop_run(&self, run_id: &str) -> Result<()> {
        let (node_ids, approval_ids) = self.deps.store.read(run_id, |state| {
            (
                state.nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>(),
                state
                    .approvals
                    .iter()
                    .map(|a| a.approval_id.clone())
                    .collect::<Vec<_>>(),
            )
        })?;

        for node_id in &node_ids {
            self.deps.sessions.interrupt(node_id).await;
        }

        let patch = RunPatch::status(RunStatus::Stopped);
        self.deps.store.update(run_id, |state| {
            patch.apply(&mut state.run);
            Ok(((), vec![EventKind::RunPatch { patch: patch.clone() }]))
        })?;

        self.deny_approvals(run_id, &approval_ids, "run stopped").await;
        self.scheduler.wake(run_id);
        Ok(())
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let node_ids = self
            .deps
            .store
            .read(run_id, |state| {
                state.nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>()
            })?;
        self.scheduler.stop(run_id);
        for node_id in &node_ids {
            self.deps.sessions.remove(node_id).await;
            self.deps.stall.reset(node_id);
        }
        self.deps.store.delete_run(run_id)
    }

    // ── Nodes ────────────────────────────────────────────────────────

    pub fn create_node(&self, run_id: &str, params: CreateNodeParams) -> Result<Node> {
        let node = self.deps.store.update(run_id, |state| {
            if let Some(alias) = &params.alias {
                if state.ref_taken(alias, None) {
                    return Err(Error::Validation(format!(
                        "alias '{alias}' collides with an existing node id or alias"
                    )));
                }
            }
            let mut node = Node::new(run_id, &params.label, &params.provider);
            node.alias = params.alias.clone();
            node.template = params.template.clone();
            node.system_prompt = params.system_prompt.clone();
            if let Some(capabilities) = params.capabilities {
                node.capabilities = capabilities;
            }
            if let Some(permissions) = params.permissions {
                node.permissions = permissions;
            }
            state.nodes.push(node.clone());
            Ok((node.clone(), vec![EventKind::NodeCreated { node }]))
        })?;
        self.scheduler.wake(run_id);
        Ok(node)
    }

    pub fn get_node(&self, run_id: &str, node_ref: &str) -> Result<Node> {
        self.deps.store.read(run_id, |state| {
            state
                .resolve_node_ref(node_ref)
                .cloned()
                .ok_or_else(|| Error::not_found("node", node_ref))
        })?
    }

    /// Update node attributes. A provider switch forces a session
    /// reset: the old adapter is closed and the next turn sends a full
    /// prompt.
    pub async fn update_node(
        &self,
        run_id: &str,
        node_id: &str,
        params: UpdateNodeParams,
    ) -> Result<Node> {
        let provider_switch = {
            let current = self.get_node(run_id, node_id)?;
            match &params.provider {
                Some(provider) if provider != &current.provider => true,
                _ => false,
            }
        };

        if provider_switch {
            self.deps.sessions.remove(node_id).await;
        }

        let node = self.deps.store.update(run_id, |state| {
            if let Some(alias) = &params.alias {
                if state.ref_taken(alias, Some(node_id)) {
                    return Err(Error::Validation(format!(
                        "alias '{alias}' collides with an existing node id or alias"
                    )));
                }
            }

            let node = state
                .node_mut(node_id)
                .ok_or_else(|| Error::not_found("node", node_id))?;
            let patch = NodePatch {
                label: params.label.clone(),
                alias: params.alias.clone(),
                provider: params.provider.clone(),
                connection: provider_switch.then(Connection::default),
                // Any reconfiguration revives a failed node.
                status: (node.status == ag_domain::NodeStatus::Failed)
                    .then_some(ag_domain::NodeStatus::Idle),
                ..Default::default()
            };
            patch.apply(node);
            if let Some(template) = &params.template {
                node.template = Some(template.clone());
            }
            if let Some(system_prompt) = &params.system_prompt {
                node.system_prompt = Some(system_prompt.clone());
            }
            if let Some(capabilities) = params.capabilities {
                node.capabilities = capabilities;
            }
            if let Some(permissions) = params.permissions {
                node.permissions = permissions;
            }
            if provider_switch {
                node.session.reset();
            }
            let node = node.clone();
            Ok((
                node.clone(),
                vec![EventKind::NodePatch {
                    node_id: node_id.to_owned(),
                    patch,
                }],
            ))
        })?;

        Ok(node)
    }

    pub async fn delete_node(&self, run_id: &str, node_id: &str) -> Result<()> {
        self.deps.sessions.remove(node_id).await;
        self.deps.stall.reset(node_id);

        let approval_ids = self.deps.store.read(run_id, |state| {
            state
                .approvals
                .iter()
                .filter(|a| a.node_id == node_id)
                .map(|a| a.approval_id.clone())
                .collect::<Vec<_>>()
        })?;
        self.deny_approvals(run_id, &approval_ids, "node deleted").await;

        self.deps.store.update(run_id, |state| {
            if state.node(node_id).is_none() {
                return Err(Error::not_found("node", node_id));
            }
            let dropped_edges = state.remove_node(node_id);
            let mut events = vec![EventKind::NodeDeleted {
                node_id: node_id.to_owned(),
            }];
            events.extend(
                dropped_edges
                    .into_iter()
                    .map(|edge_id| EventKind::EdgeDeleted { edge_id }),
            );
            Ok(((), events))
        })
    }

    /// Clear the node's provider-side state and transcript tail; the
    /// next turn starts a fresh session with a full prompt.
    pub async fn reset_node(&self, run_id: &str, node_id: &str) -> Result<()> {
        self.deps.sessions.remove(node_id).await;
        self.deps.stall.reset(node_id);
        self.deps.store.update(run_id, |state| {
            let patch = NodePatch {
                connection: Some(Connection::default()),
                ..Default::default()
            };
            let node = state
                .node_mut(node_id)
                .ok_or_else(|| Error::not_found("node", node_id))?;
            node.session.reset();
            patch.apply(node);
            Ok((
                (),
                vec![EventKind::NodePatch {
                    node_id: node_id.to_owned(),
                    patch,
                }],
            ))
        })
    }

    pub async fn start_node_process(&self, run_id: &str, node_id: &str) -> Result<()> {
        let node = self.get_node(run_id, node_id)?;
        let session =
            self.deps
                .sessions
                .get_or_create(&node.id, &node.provider, &self.deps.registry)?;
        session.adapter.start().await?;

        self.deps.store.update(run_id, |state| {
            let patch = NodePatch {
                connection: Some(Connection {
                    status: ConnectionStatus::Idle,
                    last_heartbeat_at: Some(chrono::Utc::now()),
                }),
                ..Default::default()
            };
            if let Some(node) = state.node_mut(node_id) {
                patch.apply(node);
            }
            Ok((
                (),
                vec![EventKind::NodePatch {
                    node_id: node_id.to_owned(),
                    patch,
                }],
            ))
        })
    }

    /// Terminate the adapter session unconditionally.
    pub async fn stop_node_process(&self, run_id: &str, node_id: &str) -> Result<()> {
        self.deps.sessions.remove(node_id).await;
        self.deps.store.update(run_id, |state| {
            let patch = NodePatch {
                connection: Some(Connection::default()),
                ..Default::default()
            };
            if let Some(node) = state.node_mut(node_id) {
                patch.apply(node);
            }
            Ok((
                (),
                vec![EventKind::NodePatch {
                    node_id: node_id.to_owned(),
                    patch,
                }],
            ))
        })
    }

    /// Cooperative, idempotent interrupt of the in-flight turn.
    pub async fn interrupt_node_process(&self, _run_id: &str, node_id: &str) -> Result<()> {
        self.deps.sessions.interrupt(node_id).await;
        Ok(())
    }

    // ── Edges ────────────────────────────────────────────────────────

    pub fn create_edge(&self, run_id: &str, params: CreateEdgeParams) -> Result<Edge> {
        self.deps.store.update(run_id, |state| {
            let (from, to) = crate::executor::resolve_pair(state, &params.from, &params.to)?;
            let mut edge = Edge::new(from, to);
            edge.bidirectional = params.bidirectional;
            edge.edge_type = params.edge_type;
            edge.label = params.label.clone();
            state.edges.push(edge.clone());
            Ok((edge.clone(), vec![EventKind::EdgeCreated { edge }]))
        })
    }

    pub fn delete_edge(&self, run_id: &str, edge_id: &str) -> Result<()> {
        self.deps.store.update(run_id, |state| {
            let before = state.edges.len();
            state.edges.retain(|e| e.id != edge_id);
            if state.edges.len() == before {
                return Err(Error::not_found("edge", edge_id));
            }
            Ok((
                (),
                vec![EventKind::EdgeDeleted {
                    edge_id: edge_id.to_owned(),
                }],
            ))
        })
    }

    // ── Chat ─────────────────────────────────────────────────────────

    /// Post a user message to a node's inbox. `interrupt = true` aborts
    /// the node's in-flight turn first; otherwise the message waits its
    /// turn.
    pub async fn post_message(&self, run_id: &str, params: PostMessageParams) -> Result<()> {
        let target = self.deps.store.read(run_id, |state| {
            match &params.node_id {
                Some(node_ref) => state
                    .resolve_node_ref(node_ref)
                    .map(|n| n.id.clone())
                    .ok_or_else(|| Error::not_found("node", node_ref)),
                None => {
                    // Without an explicit target the run must be
                    // unambiguous.
                    if state.nodes.len() == 1 {
                        Ok(state.nodes[0].id.clone())
                    } else {
                        Err(Error::Validation(
                            "nodeId is required for runs with more than one node".into(),
                        ))
                    }
                }
            }
        })??;

        if params.interrupt {
            self.deps.sessions.interrupt(&target).await;
        }

        let item = InboxItem::user(&params.content);
        let message_id = item.id().to_owned();
        self.deps.store.update(run_id, |state| {
            state.push_inbox(&target, item.clone())?;
            let mut events = vec![EventKind::UserMessage {
                node_id: target.clone(),
                message_id: message_id.clone(),
                content: params.content.clone(),
            }];
            // Fresh input revives a failed node.
            if let Some(node) = state.node_mut(&target) {
                if node.status == ag_domain::NodeStatus::Failed {
                    let patch = NodePatch::status(ag_domain::NodeStatus::Idle);
                    patch.apply(node);
                    events.push(EventKind::NodePatch {
                        node_id: target.clone(),
                        patch,
                    });
                }
            }
            Ok(((), events))
        })?;

        self.scheduler.wake(run_id);
        Ok(())
    }

    // ── Approvals ────────────────────────────────────────────────────

    pub fn list_approvals(&self, run_id: &str) -> Result<Vec<ApprovalRequest>> {
        self.deps.store.read(run_id, |state| state.approvals.clone())
    }

    pub fn get_approval(&self, run_id: &str, approval_id: &str) -> Result<ApprovalRequest> {
        self.deps.store.read(run_id, |state| {
            state
                .approvals
                .iter()
                .find(|a| a.approval_id == approval_id)
                .cloned()
                .ok_or_else(|| Error::not_found("approval", approval_id))
        })?
    }

    pub async fn resolve_approval(
        &self,
        run_id: &str,
        approval_id: &str,
        resolution: ApprovalResolution,
    ) -> Result<()> {
        let status = resolution.status;
        let feedback = resolution.feedback.clone();
        let routed = self.deps.approvals.resolve(approval_id, resolution).await?;

        // Gate approvals clean up through the waiting executor; native
        // ones are finalized here (unless the adapter's own echo beat
        // us to it).
        if routed == Routed::Native {
            if let Ok(approval) = self.get_approval(run_id, approval_id) {
                self.deps.store.update(run_id, |state| {
                    state.approvals.retain(|a| a.approval_id != approval_id);
                    Ok((
                        (),
                        vec![EventKind::ApprovalResolved {
                            approval_id: approval_id.to_owned(),
                            node_id: approval.node_id.clone(),
                            status,
                            feedback: feedback.clone(),
                        }],
                    ))
                })?;
            }
        }
        Ok(())
    }

    async fn deny_approvals(&self, run_id: &str, approval_ids: &[String], note: &str) {
        for approval_id in approval_ids {
            let resolution = ApprovalResolution::denied(Some(note.to_owned()));
            match self.deps.approvals.resolve(approval_id, resolution).await {
                Ok(Routed::Gate) => {}
                Ok(Routed::Native) | Err(_) => {
                    // No executor will clean this one up.
                    let _ = self.deps.store.update(run_id, |state| {
                        let node_id = state
                            .approvals
                            .iter()
                            .find(|a| &a.approval_id == approval_id)
                            .map(|a| a.node_id.clone());
                        state.approvals.retain(|a| &a.approval_id != approval_id);
                        match node_id {
                            Some(node_id) => Ok((
                                (),
                                vec![EventKind::ApprovalResolved {
                                    approval_id: approval_id.clone(),
                                    node_id,
                                    status: ag_domain::ApprovalStatus::Denied,
                                    feedback: Some(note.to_owned()),
                                }],
                            )),
                            None => Ok(((), vec![])),
                        }
                    });
                }
            }
        }
    }

    // ── Artifacts ────────────────────────────────────────────────────

    pub async fn record_artifact(
        &self,
        run_id: &str,
        node_id: &str,
        kind: ArtifactKind,
        name: &str,
        content: &[u8],
        metadata: Option<Value>,
    ) -> Result<Artifact> {
        let mut artifact = Artifact::new(run_id, node_id, kind, name);
        artifact.metadata = metadata;
        let artifact = self.deps.artifacts.write(artifact, content).await?;
        self.deps.store.update(run_id, |state| {
            state.artifacts.push(artifact.clone());
            Ok((
                (),
                vec![EventKind::ArtifactCreated {
                    artifact: artifact.clone(),
                }],
            ))
        })?;
        Ok(artifact)
    }

    pub fn get_artifact(&self, run_id: &str, artifact_id: &str) -> Result<Artifact> {
        self.deps.store.read(run_id, |state| {
            state
                .artifacts
                .iter()
                .find(|a| a.id == artifact_id)
                .cloned()
                .ok_or_else(|| Error::not_found("artifact", artifact_id))
        })?
    }

    pub async fn read_artifact(&self, run_id: &str, artifact_id: &str) -> Result<Vec<u8>> {
        let artifact = self.get_artifact(run_id, artifact_id)?;
        self.deps.artifacts.read(&artifact.path).await
    }

    // ── Handoffs ─────────────────────────────────────────────────────

    /// Inject an envelope into the target node's inbox (external
    /// router path — edge authorization applies to the `send_handoff`
    /// tool, not to the operator surface).
    pub fn deliver_envelope(&self, run_id: &str, envelope: Envelope) -> Result<()> {
        self.deps.store.update(run_id, |state| {
            if state.node(&envelope.to_node_id).is_none() {
                return Err(Error::not_found("node", &envelope.to_node_id));
            }
            state.push_inbox(
                &envelope.to_node_id,
                InboxItem::Handoff {
                    envelope: envelope.clone(),
                },
            )?;
            Ok((
                (),
                vec![EventKind::HandoffSent {
                    envelope: envelope.clone(),
                }],
            ))
        })?;
        self.scheduler.wake(run_id);
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────

    pub fn get_events(
        &self,
        run_id: &str,
        before: Option<u64>,
        limit: usize,
    ) -> Result<EventPage> {
        self.deps.store.events_page(run_id, before, limit)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.deps.store.bus().subscribe()
    }

    pub fn subscribe_run(&self, run_id: &str) -> broadcast::Receiver<Event> {
        self.deps.store.bus().subscribe_run(run_id)
    }

    // ── Templates + filesystem helpers ───────────────────────────────

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Sandboxed directory listing under the workspace root, filtered
    /// to non-hidden entries.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let root = &self.config.workspace.root_dir;
        let resolved = ag_tools::file_ops::resolve_in_root(root, path)
            .map_err(Error::Validation)?;

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&resolved)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(DirectoryEntry { name, is_dir });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    // ── Introspection (tests, transports) ────────────────────────────

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.deps.registry
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.deps.store
    }
}

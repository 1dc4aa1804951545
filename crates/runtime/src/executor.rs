//! The tool executor.
//!
//! Every tool call passes three stages: the capability gate (what this
//! node may do at all), the approval gate (what a human must sign off
//! on), and execution. Denials become tool errors in the transcript —
//! the turn keeps going. The tool set is closed; dispatch is an
//! exhaustive match so a new tool forces updates here.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use ag_domain::config::Config;
use ag_domain::{
    ApprovalRequest, ApprovalStatus, Capabilities, CliPermissionsMode, EdgeManagement, Envelope,
    EnvelopePayload, Edge, EventKind, GlobalMode, InboxItem, Node, NodePatch, NodeStatus,
    Permissions, ToolCall, ToolName, ToolResult,
};
use ag_store::RunStore;
use ag_tools::{run_command, CommandRequest, CommandSecurity};

use crate::approvals::{await_resolution, ApprovalGate};

pub struct ToolContext {
    pub run_id: String,
    pub node_id: String,
    pub turn_id: String,
}

pub struct ToolExecutor {
    config: Arc<Config>,
    store: Arc<RunStore>,
    approvals: Arc<ApprovalGate>,
    security: Arc<CommandSecurity>,
}

/// Caller-side view of the gates, snapshotted under one read lock.
struct GateView {
    capabilities: Capabilities,
    permissions: Permissions,
    global_mode: GlobalMode,
    working_dir: std::path::PathBuf,
    provider: String,
}

impl ToolExecutor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<RunStore>,
        approvals: Arc<ApprovalGate>,
        security: Arc<CommandSecurity>,
    ) -> Self {
        Self {
            config,
            store,
            approvals,
            security,
        }
    }

    /// Run one tool call through capability gate → approval gate →
    /// execution. Always returns a result; failures are tool errors,
    /// never turn crashes.
    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolResult {
        let Some(tool) = ToolName::parse(&call.name) else {
            return ToolResult::error(call, format!("unknown tool '{}'", call.name));
        };

        let view = match self.store.read(&ctx.run_id, |state| {
            state.node(&ctx.node_id).map(|node| GateView {
                capabilities: node.capabilities,
                permissions: node.permissions,
                global_mode: state.run.global_mode,
                working_dir: state.run.working_dir.clone(),
                provider: node.provider.clone(),
            })
        }) {
            Ok(Some(view)) => view,
            Ok(None) => return ToolResult::error(call, "calling node no longer exists"),
            Err(e) => return ToolResult::error(call, e.to_string()),
        };

        // ── Capability gate ──────────────────────────────────────────
        if let Err(denied) = self.capability_gate(ctx, tool, &call.args, &view) {
            tracing::debug!(node_id = %ctx.node_id, tool = %call.name, %denied, "capability denied");
            let result = ToolResult::error(call, format!("capability denied: {denied}"));
            self.record_completed(ctx, &result);
            return result;
        }

        // ── Approval gate ────────────────────────────────────────────
        let needs_approval = view.permissions.cli_permissions_mode == CliPermissionsMode::Gated
            || (tool.is_agent_management()
                && view.permissions.agent_management_requires_approval);

        let mut effective_args = call.args.clone();
        if needs_approval {
            match self.gate_behind_approval(ctx, call).await {
                ApprovalOutcome::Approved => {}
                ApprovalOutcome::Modified(args) => effective_args = args,
                ApprovalOutcome::Denied(note) => {
                    let result = ToolResult::error(call, note);
                    self.record_completed(ctx, &result);
                    return result;
                }
            }
        }

        // ── Execute ──────────────────────────────────────────────────
        let _ = self.store.record(
            &ctx.run_id,
            EventKind::ToolStarted {
                node_id: ctx.node_id.clone(),
                call_id: call.id.clone(),
                name: call.name.clone(),
            },
        );

        let result = match tool {
            ToolName::Command => self.run_shell(call, &effective_args, &view).await,
            ToolName::ReadFile => self.read_file(call, &effective_args, &view).await,
            ToolName::WriteFile => self.write_file(call, &effective_args, &view).await,
            ToolName::ListFiles => self.list_files(call, &effective_args, &view).await,
            ToolName::DeleteFile => self.delete_file(call, &effective_args, &view).await,
            ToolName::SpawnNode => self.spawn_node(ctx, call, &effective_args, &view),
            ToolName::CreateEdge => self.create_edge(ctx, call, &effective_args),
            ToolName::SendHandoff => self.send_handoff(ctx, call, &effective_args),
        };

        self.record_completed(ctx, &result);
        result
    }

    fn record_completed(&self, ctx: &ToolContext, result: &ToolResult) {
        let _ = self.store.record(
            &ctx.run_id,
            EventKind::ToolCompleted {
                node_id: ctx.node_id.clone(),
                call_id: result.call_id.clone(),
                name: result.name.clone(),
                ok: result.ok,
                output: result.output.clone(),
                result: result.result.clone(),
                error: result.error.clone(),
            },
        );
    }

    // ── Capability gate ──────────────────────────────────────────────

    fn capability_gate(
        &self,
        ctx: &ToolContext,
        tool: ToolName,
        args: &Value,
        view: &GateView,
    ) -> Result<(), String> {
        let caps = &view.capabilities;
        match tool {
            ToolName::Command => {
                if !caps.run_commands {
                    return Err("node may not run commands".into());
                }
            }
            ToolName::ReadFile | ToolName::ListFiles => {}
            ToolName::WriteFile | ToolName::DeleteFile => {
                let path = args.get("path").and_then(Value::as_str).unwrap_or("");
                // Planning mode forces writeCode off; docs stay open to
                // writeDocs.
                let write_code =
                    caps.write_code && view.global_mode == GlobalMode::Implementation;
                let allowed = write_code || (caps.write_docs && is_docs_path(path, &self.config));
                if !allowed {
                    return Err(match view.global_mode {
                        GlobalMode::Planning => {
                            format!("write to '{path}' not permitted in planning mode")
                        }
                        GlobalMode::Implementation => {
                            format!("node may not write '{path}'")
                        }
                    });
                }
            }
            ToolName::SpawnNode => {
                if caps.edge_management != EdgeManagement::All {
                    return Err("spawn_node requires edgeManagement=all".into());
                }
            }
            ToolName::CreateEdge => match caps.edge_management {
                EdgeManagement::All => {}
                EdgeManagement::Self_ => {
                    let endpoint = self.caller_is_endpoint(ctx, args).unwrap_or(false);
                    if !endpoint {
                        return Err(
                            "edgeManagement=self only permits edges with this node as an endpoint"
                                .into(),
                        );
                    }
                }
                EdgeManagement::None => {
                    return Err("create_edge requires edgeManagement=self or all".into());
                }
            },
            ToolName::SendHandoff => {}
        }
        Ok(())
    }

    fn caller_is_endpoint(&self, ctx: &ToolContext, args: &Value) -> Option<bool> {
        let from = args.get("from").and_then(Value::as_str)?.to_owned();
        let to = args.get("to").and_then(Value::as_str)?.to_owned();
        self.store
            .read(&ctx.run_id, |state| {
                let from_id = state.resolve_node_ref(&from).map(|n| n.id.clone());
                let to_id = state.resolve_node_ref(&to).map(|n| n.id.clone());
                from_id.as_deref() == Some(&ctx.node_id) || to_id.as_deref() == Some(&ctx.node_id)
            })
            .ok()
    }

    // ── Approval gate ────────────────────────────────────────────────

    async fn gate_behind_approval(&self, ctx: &ToolContext, call: &ToolCall) -> ApprovalOutcome {
        let mut request = ApprovalRequest::new(
            &ctx.run_id,
            &ctx.node_id,
            &call.name,
            json!({ "callId": call.id, "turnId": ctx.turn_id, "args": call.args }),
        );
        let deadline = self.config.tools.approval_timeout_sec.map(Duration::from_secs);
        if let Some(timeout) = deadline {
            let window = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
            request.deadline_at = Some(request.created_at + window);
        }
        let approval_id = request.approval_id.clone();

        let rx = self.approvals.insert(&request);

        // Park the node: approval.requested + status=blocked, then wait.
        let recorded = self.store.update(&ctx.run_id, |state| {
            state.approvals.push(request.clone());
            let patch = NodePatch::status(NodeStatus::Blocked);
            if let Some(node) = state.node_mut(&ctx.node_id) {
                patch.apply(node);
            }
            Ok((
                (),
                vec![
                    EventKind::ApprovalRequested {
                        approval: request.clone(),
                    },
                    EventKind::NodePatch {
                        node_id: ctx.node_id.clone(),
                        patch,
                    },
                ],
            ))
        });
        if let Err(e) = recorded {
            self.approvals.remove(&approval_id);
            return ApprovalOutcome::Denied(format!("approval could not be recorded: {e}"));
        }

        let resolution = await_resolution(&self.approvals, &approval_id, rx, deadline).await;

        // Unpark: approval.resolved + status back to running.
        let status = resolution.status;
        let feedback = resolution.feedback.clone();
        let _ = self.store.update(&ctx.run_id, |state| {
            state.approvals.retain(|a| a.approval_id != approval_id);
            let patch = NodePatch::status(NodeStatus::Running);
            if let Some(node) = state.node_mut(&ctx.node_id) {
                patch.apply(node);
            }
            Ok((
                (),
                vec![
                    EventKind::ApprovalResolved {
                        approval_id: approval_id.clone(),
                        node_id: ctx.node_id.clone(),
                        status,
                        feedback: feedback.clone(),
                    },
                    EventKind::NodePatch {
                        node_id: ctx.node_id.clone(),
                        patch,
                    },
                ],
            ))
        });

        match resolution.status {
            ApprovalStatus::Approved => ApprovalOutcome::Approved,
            ApprovalStatus::Modified => match resolution.modified_args {
                Some(args) => ApprovalOutcome::Modified(args),
                None => ApprovalOutcome::Approved,
            },
            ApprovalStatus::Denied => {
                let note = match resolution.feedback {
                    Some(feedback) => format!("denied by user: {feedback}"),
                    None => "denied by user".into(),
                };
                ApprovalOutcome::Denied(note)
            }
        }
    }

    // ── Workspace tools ──────────────────────────────────────────────

    async fn run_shell(&self, call: &ToolCall, args: &Value, view: &GateView) -> ToolResult {
        let request: CommandRequest = match serde_json::from_value(args.clone()) {
            Ok(request) => request,
            Err(e) => return ToolResult::error(call, format!("invalid command args: {e}")),
        };
        let outcome = run_command(
            &view.working_dir,
            request,
            &self.config.tools.exec,
            &self.security,
        )
        .await;

        if outcome.ok() {
            ToolResult::ok_output(call, outcome.output)
        } else {
            let mut result = ToolResult::error(
                call,
                match outcome.exit_code {
                    Some(code) => format!("command failed with exit code {code}"),
                    None => format!("command {:?}", outcome.status).to_lowercase(),
                },
            );
            result.output = Some(outcome.output);
            result
        }
    }

    async fn read_file(&self, call: &ToolCall, args: &Value, view: &GateView) -> ToolResult {
        let path = match required_str(args, "path") {
            Ok(path) => path,
            Err(e) => return ToolResult::error(call, e),
        };
        let offset = args.get("offset").and_then(Value::as_u64).map(|n| n as usize);
        let limit = args.get("limit").and_then(Value::as_u64).map(|n| n as usize);
        match ag_tools::file_ops::read_file(&view.working_dir, &path, offset, limit).await {
            Ok(result) => ToolResult::ok_result(call, result),
            Err(e) => ToolResult::error(call, e),
        }
    }

    async fn write_file(&self, call: &ToolCall, args: &Value, view: &GateView) -> ToolResult {
        let path = match required_str(args, "path") {
            Ok(path) => path,
            Err(e) => return ToolResult::error(call, e),
        };
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        match ag_tools::file_ops::write_file(&view.working_dir, &path, content).await {
            Ok(result) => ToolResult::ok_result(call, result),
            Err(e) => ToolResult::error(call, e),
        }
    }

    async fn list_files(&self, call: &ToolCall, args: &Value, view: &GateView) -> ToolResult {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_owned();
        match ag_tools::file_ops::list_files(&view.working_dir, &path).await {
            Ok(result) => ToolResult::ok_result(call, result),
            Err(e) => ToolResult::error(call, e),
        }
    }

    async fn delete_file(&self, call: &ToolCall, args: &Value, view: &GateView) -> ToolResult {
        let path = match required_str(args, "path") {
            Ok(path) => path,
            Err(e) => return ToolResult::error(call, e),
        };
        match ag_tools::file_ops::delete_file(&view.working_dir, &path).await {
            Ok(result) => ToolResult::ok_result(call, result),
            Err(e) => ToolResult::error(call, e),
        }
    }

    // ── Agent-management tools ───────────────────────────────────────

    fn spawn_node(
        &self,
        ctx: &ToolContext,
        call: &ToolCall,
        args: &Value,
        view: &GateView,
    ) -> ToolResult {
        let label = args
            .get("label")
            .and_then(Value::as_str)
            .or_else(|| args.get("alias").and_then(Value::as_str))
            .unwrap_or("agent")
            .to_owned();
        let alias = args.get("alias").and_then(Value::as_str).map(str::to_owned);
        let provider = args
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or(&view.provider)
            .to_owned();

        let spawned = self.store.update(&ctx.run_id, |state| {
            if let Some(alias) = &alias {
                if state.ref_taken(alias, None) {
                    return Err(ag_domain::Error::Validation(format!(
                        "alias '{alias}' collides with an existing node id or alias"
                    )));
                }
            }
            let mut node = Node::new(&ctx.run_id, &label, &provider);
            node.alias = alias.clone();
            if let Some(template) = args.get("template").and_then(Value::as_str) {
                node.template = Some(template.to_owned());
            }
            if let Some(system_prompt) = args.get("systemPrompt").and_then(Value::as_str) {
                node.system_prompt = Some(system_prompt.to_owned());
            }
            state.nodes.push(node.clone());
            Ok((node.clone(), vec![EventKind::NodeCreated { node }]))
        });

        match spawned {
            Ok(node) => ToolResult::ok_result(
                call,
                json!({ "nodeId": node.id, "label": node.label, "alias": node.alias }),
            ),
            Err(e) => ToolResult::error(call, e.to_string()),
        }
    }

    fn create_edge(&self, ctx: &ToolContext, call: &ToolCall, args: &Value) -> ToolResult {
        let from_ref = match required_str(args, "from") {
            Ok(v) => v,
            Err(e) => return ToolResult::error(call, e),
        };
        let to_ref = match required_str(args, "to") {
            Ok(v) => v,
            Err(e) => return ToolResult::error(call, e),
        };

        let created = self.store.update(&ctx.run_id, |state| {
            let (from, to) = resolve_pair(state, &from_ref, &to_ref)?;
            let mut edge = Edge::new(from, to);
            edge.bidirectional = args
                .get("bidirectional")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if let Some(edge_type) = args.get("type") {
                if let Ok(parsed) = serde_json::from_value(edge_type.clone()) {
                    edge.edge_type = parsed;
                }
            }
            if let Some(label) = args.get("label").and_then(Value::as_str) {
                edge.label = label.to_owned();
            }
            state.edges.push(edge.clone());
            Ok((edge.clone(), vec![EventKind::EdgeCreated { edge }]))
        });

        match created {
            Ok(edge) => ToolResult::ok_result(
                call,
                json!({ "edgeId": edge.id, "from": edge.from, "to": edge.to }),
            ),
            Err(e) => ToolResult::error(call, e.to_string()),
        }
    }

    fn send_handoff(&self, ctx: &ToolContext, call: &ToolCall, args: &Value) -> ToolResult {
        let to_ref = match required_str(args, "to") {
            Ok(v) => v,
            Err(e) => return ToolResult::error(call, e),
        };
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();

        let sent = self.store.update(&ctx.run_id, |state| {
            let Some(target) = state.resolve_node_ref(&to_ref).map(|n| n.id.clone()) else {
                return Err(ag_domain::Error::Validation(format!(
                    "unknown node refs: {to_ref}"
                )));
            };
            if state.edge_permitting(&ctx.node_id, &target).is_none() {
                return Err(ag_domain::Error::Validation(format!(
                    "no edge permits a handoff from {} to {}",
                    state.node_display(&ctx.node_id),
                    state.node_display(&target),
                )));
            }

            let envelope = Envelope::new(
                &ctx.node_id,
                &target,
                EnvelopePayload {
                    message: message.clone(),
                    structured: args.get("structured").cloned(),
                    artifacts: args.get("artifacts").and_then(|v| {
                        serde_json::from_value::<Vec<String>>(v.clone()).ok()
                    }),
                    status: args.get("status").and_then(Value::as_str).map(str::to_owned),
                    response: args
                        .get("response")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                },
            );
            state.push_inbox(
                &target,
                InboxItem::Handoff {
                    envelope: envelope.clone(),
                },
            )?;
            Ok((
                envelope.clone(),
                vec![EventKind::HandoffSent { envelope }],
            ))
        });

        match sent {
            Ok(envelope) => ToolResult::ok_result(
                call,
                json!({ "envelopeId": envelope.id, "to": envelope.to_node_id }),
            ),
            Err(e) => ToolResult::error(call, e.to_string()),
        }
    }
}

enum ApprovalOutcome {
    Approved,
    Modified(Value),
    Denied(String),
}

fn required_str(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| format!("missing required argument '{key}'"))
}

/// Resolve two node refs at once, reporting every missing ref in one
/// error message.
pub(crate) fn resolve_pair(
    state: &ag_store::RunState,
    from_ref: &str,
    to_ref: &str,
) -> Result<(String, String), ag_domain::Error> {
    let from = state.resolve_node_ref(from_ref).map(|n| n.id.clone());
    let to = state.resolve_node_ref(to_ref).map(|n| n.id.clone());
    match (from, to) {
        (Some(from), Some(to)) => Ok((from, to)),
        (from, to) => {
            let mut missing = Vec::new();
            if from.is_none() {
                missing.push(from_ref);
            }
            if to.is_none() {
                missing.push(to_ref);
            }
            Err(ag_domain::Error::Validation(format!(
                "unknown node refs: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Paths the `writeDocs` capability covers.
fn is_docs_path(path: &str, config: &Config) -> bool {
    let lowered = path.to_ascii_lowercase();
    if lowered.ends_with(".md") || lowered.ends_with(".markdown") || lowered.ends_with(".txt") {
        return true;
    }
    let docs_dir = config.planning.docs_directory.to_string_lossy().to_lowercase();
    let docs_dir = docs_dir.trim_start_matches("./");
    !docs_dir.is_empty() && lowered.starts_with(docs_dir)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::{ApprovalResolution, OrchestrationMode, Run};
    use ag_store::EventBus;
    use std::path::PathBuf;

    struct Fixture {
        executor: ToolExecutor,
        store: Arc<RunStore>,
        approvals: Arc<ApprovalGate>,
        run_id: String,
        node_id: String,
        _dir: tempfile::TempDir,
        workspace: tempfile::TempDir,
    }

    fn fixture(tune: impl FnOnce(&mut Node)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.path(), Arc::new(EventBus::new())));
        let approvals = Arc::new(ApprovalGate::new());
        let config = Arc::new(Config::default());

        let run = store
            .create_run(Run::new(
                workspace.path().to_path_buf(),
                OrchestrationMode::Interactive,
                GlobalMode::Implementation,
            ))
            .unwrap();
        let mut node = Node::new(&run.id, "worker", "mock");
        node.capabilities.run_commands = true;
        node.capabilities.write_code = true;
        tune(&mut node);
        let node_id = node.id.clone();
        store
            .update(&run.id, |state| {
                state.nodes.push(node.clone());
                Ok(((), vec![EventKind::NodeCreated { node: node.clone() }]))
            })
            .unwrap();

        Fixture {
            executor: ToolExecutor::new(
                config,
                store.clone(),
                approvals.clone(),
                Arc::new(CommandSecurity::empty()),
            ),
            store,
            approvals,
            run_id: run.id,
            node_id,
            _dir: dir,
            workspace,
        }
    }

    fn ctx(f: &Fixture) -> ToolContext {
        ToolContext {
            run_id: f.run_id.clone(),
            node_id: f.node_id.clone(),
            turn_id: "turn_1".into(),
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn command_runs_and_reports_output() {
        let f = fixture(|_| {});
        let result = f
            .executor
            .execute(&ctx(&f), &call("command", json!({"cmd": "echo hi"})))
            .await;
        assert!(result.ok);
        assert_eq!(result.output.as_deref(), Some("hi\n"));

        let events = f.store.events_all(&f.run_id).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::ToolStarted { call_id, .. } if call_id == "t1")));
        assert!(events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::ToolCompleted { ok: true, .. })));
    }

    #[tokio::test]
    async fn command_without_capability_is_denied() {
        let f = fixture(|node| node.capabilities.run_commands = false);
        let result = f
            .executor
            .execute(&ctx(&f), &call("command", json!({"cmd": "echo hi"})))
            .await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("capability denied"));
        // No tool.started for a denied call.
        let events = f.store.events_all(&f.run_id).unwrap();
        assert!(!events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::ToolStarted { .. })));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_explicit_error() {
        let f = fixture(|_| {});
        let result = f.executor.execute(&ctx(&f), &call("teleport", json!({}))).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("unknown tool 'teleport'"));
    }

    #[tokio::test]
    async fn write_file_blocked_in_planning_mode_for_code() {
        let f = fixture(|_| {});
        f.store
            .update(&f.run_id, |state| {
                state.run.global_mode = GlobalMode::Planning;
                Ok(((), vec![]))
            })
            .unwrap();

        let code = f
            .executor
            .execute(
                &ctx(&f),
                &call("write_file", json!({"path": "src/main.rs", "content": "x"})),
            )
            .await;
        assert!(!code.ok);
        assert!(code.error.unwrap().contains("planning mode"));

        // Docs still writable through writeDocs.
        let docs = f
            .executor
            .execute(
                &ctx(&f),
                &call("write_file", json!({"path": "notes.md", "content": "# plan"})),
            )
            .await;
        assert!(docs.ok, "docs write failed: {:?}", docs.error);
        assert!(f.workspace.path().join("notes.md").exists());
    }

    #[tokio::test]
    async fn file_round_trip_via_tools() {
        let f = fixture(|_| {});
        let c = ctx(&f);
        assert!(
            f.executor
                .execute(&c, &call("write_file", json!({"path": "a.txt", "content": "one\ntwo"})))
                .await
                .ok
        );
        let read = f
            .executor
            .execute(&c, &call("read_file", json!({"path": "a.txt"})))
            .await;
        assert!(read.ok);
        assert_eq!(read.result.unwrap()["content"], "one\ntwo");

        let list = f
            .executor
            .execute(&c, &call("list_files", json!({})))
            .await;
        assert!(list.ok);
        assert_eq!(list.result.unwrap()["count"], 1);

        assert!(
            f.executor
                .execute(&c, &call("delete_file", json!({"path": "a.txt"})))
                .await
                .ok
        );
        assert!(!f.workspace.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn spawn_node_requires_edge_management_all() {
        let f = fixture(|node| node.capabilities.edge_management = EdgeManagement::Self_);
        let result = f
            .executor
            .execute(&ctx(&f), &call("spawn_node", json!({"alias": "helper"})))
            .await;
        assert!(!result.ok);

        let f = fixture(|node| node.capabilities.edge_management = EdgeManagement::All);
        let result = f
            .executor
            .execute(&ctx(&f), &call("spawn_node", json!({"alias": "helper"})))
            .await;
        assert!(result.ok);
        let spawned = result.result.unwrap();
        assert_eq!(spawned["alias"], "helper");

        f.store
            .read(&f.run_id, |state| {
                assert_eq!(state.nodes.len(), 2);
                assert!(state.resolve_node_ref("helper").is_some());
            })
            .unwrap();
    }

    #[tokio::test]
    async fn spawn_node_rejects_alias_collisions() {
        let f = fixture(|node| {
            node.capabilities.edge_management = EdgeManagement::All;
            node.alias = Some("worker".into());
        });
        let result = f
            .executor
            .execute(&ctx(&f), &call("spawn_node", json!({"alias": "worker"})))
            .await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("collides"));
    }

    #[tokio::test]
    async fn create_edge_self_requires_endpoint() {
        let f = fixture(|node| {
            node.capabilities.edge_management = EdgeManagement::Self_;
            node.alias = Some("me".into());
        });
        // Another pair of nodes the caller is not part of.
        let (a, b) = f
            .store
            .update(&f.run_id, |state| {
                let a = Node::new(&f.run_id, "a", "mock");
                let b = Node::new(&f.run_id, "b", "mock");
                let (a_id, b_id) = (a.id.clone(), b.id.clone());
                state.nodes.push(a.clone());
                state.nodes.push(b.clone());
                Ok((
                    (a_id, b_id),
                    vec![
                        EventKind::NodeCreated { node: a },
                        EventKind::NodeCreated { node: b },
                    ],
                ))
            })
            .unwrap();

        let foreign = f
            .executor
            .execute(&ctx(&f), &call("create_edge", json!({"from": a, "to": b})))
            .await;
        assert!(!foreign.ok);

        let own = f
            .executor
            .execute(&ctx(&f), &call("create_edge", json!({"from": "me", "to": a})))
            .await;
        assert!(own.ok, "own edge failed: {:?}", own.error);
    }

    #[tokio::test]
    async fn create_edge_enumerates_missing_refs() {
        let f = fixture(|node| node.capabilities.edge_management = EdgeManagement::All);
        let result = f
            .executor
            .execute(
                &ctx(&f),
                &call("create_edge", json!({"from": "ghost1", "to": "ghost2"})),
            )
            .await;
        assert!(!result.ok);
        let error = result.error.unwrap();
        assert!(error.contains("ghost1"));
        assert!(error.contains("ghost2"));
    }

    #[tokio::test]
    async fn send_handoff_requires_an_edge() {
        let f = fixture(|_| {});
        let target_id = f
            .store
            .update(&f.run_id, |state| {
                let mut target = Node::new(&f.run_id, "target", "mock");
                target.alias = Some("B".into());
                let id = target.id.clone();
                state.nodes.push(target.clone());
                Ok((id, vec![EventKind::NodeCreated { node: target }]))
            })
            .unwrap();

        // No edge yet.
        let denied = f
            .executor
            .execute(
                &ctx(&f),
                &call("send_handoff", json!({"to": "B", "message": "please verify"})),
            )
            .await;
        assert!(!denied.ok);
        assert!(denied.error.unwrap().contains("no edge permits"));

        // Add the edge and retry.
        f.store
            .update(&f.run_id, |state| {
                let mut edge = Edge::new(&f.node_id, &target_id);
                edge.bidirectional = true;
                state.edges.push(edge.clone());
                Ok(((), vec![EventKind::EdgeCreated { edge }]))
            })
            .unwrap();

        let sent = f
            .executor
            .execute(
                &ctx(&f),
                &call("send_handoff", json!({"to": "B", "message": "please verify"})),
            )
            .await;
        assert!(sent.ok);

        f.store
            .read(&f.run_id, |state| {
                assert_eq!(state.node(&target_id).unwrap().inbox_count, 1);
                match state.inboxes[&target_id].front().unwrap() {
                    InboxItem::Handoff { envelope } => {
                        assert_eq!(envelope.payload.message, "please verify");
                        assert_eq!(envelope.from_node_id, f.node_id);
                    }
                    other => panic!("unexpected inbox item: {other:?}"),
                }
            })
            .unwrap();
    }

    #[tokio::test]
    async fn gated_node_waits_for_approval() {
        let f = fixture(|node| {
            node.permissions.cli_permissions_mode = CliPermissionsMode::Gated;
        });
        let c = ctx(&f);

        // Resolve the approval as soon as it shows up in the store.
        let store = f.store.clone();
        let approvals = f.approvals.clone();
        let run_id = f.run_id.clone();
        let node_id = f.node_id.clone();
        tokio::spawn(async move {
            loop {
                let pending = store
                    .read(&run_id, |state| {
                        state.approvals.first().map(|a| a.approval_id.clone())
                    })
                    .unwrap();
                if let Some(approval_id) = pending {
                    // The node must be blocked while parked.
                    let status = store
                        .read(&run_id, |state| state.node(&node_id).unwrap().status)
                        .unwrap();
                    assert_eq!(status, NodeStatus::Blocked);
                    approvals
                        .resolve(&approval_id, ApprovalResolution::approved())
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let result = f
            .executor
            .execute(&c, &call("command", json!({"cmd": "echo hi"})))
            .await;
        assert!(result.ok);
        assert_eq!(result.output.as_deref(), Some("hi\n"));

        let events = f.store.events_all(&f.run_id).unwrap();
        let order: Vec<&str> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ApprovalRequested { .. } => Some("requested"),
                EventKind::ApprovalResolved { .. } => Some("resolved"),
                EventKind::ToolStarted { .. } => Some("started"),
                EventKind::ToolCompleted { .. } => Some("completed"),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["requested", "resolved", "started", "completed"]);
    }

    #[tokio::test]
    async fn denied_approval_becomes_a_tool_error() {
        let f = fixture(|node| {
            node.permissions.cli_permissions_mode = CliPermissionsMode::Gated;
        });

        let store = f.store.clone();
        let approvals = f.approvals.clone();
        let run_id = f.run_id.clone();
        tokio::spawn(async move {
            loop {
                let pending = store
                    .read(&run_id, |state| {
                        state.approvals.first().map(|a| a.approval_id.clone())
                    })
                    .unwrap();
                if let Some(approval_id) = pending {
                    approvals
                        .resolve(
                            &approval_id,
                            ApprovalResolution::denied(Some("not today".into())),
                        )
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let result = f
            .executor
            .execute(&ctx(&f), &call("command", json!({"cmd": "rm -rf /"})))
            .await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("not today"));
    }

    #[tokio::test]
    async fn modified_approval_swaps_the_args() {
        let f = fixture(|node| {
            node.permissions.cli_permissions_mode = CliPermissionsMode::Gated;
        });

        let store = f.store.clone();
        let approvals = f.approvals.clone();
        let run_id = f.run_id.clone();
        tokio::spawn(async move {
            loop {
                let pending = store
                    .read(&run_id, |state| {
                        state.approvals.first().map(|a| a.approval_id.clone())
                    })
                    .unwrap();
                if let Some(approval_id) = pending {
                    approvals
                        .resolve(
                            &approval_id,
                            ApprovalResolution::modified(json!({"cmd": "echo modified"})),
                        )
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let result = f
            .executor
            .execute(&ctx(&f), &call("command", json!({"cmd": "echo original"})))
            .await;
        assert!(result.ok);
        assert_eq!(result.output.as_deref(), Some("modified\n"));
    }

    #[tokio::test]
    async fn agent_management_approval_gates_spawn() {
        let f = fixture(|node| {
            node.capabilities.edge_management = EdgeManagement::All;
            node.permissions.agent_management_requires_approval = true;
        });

        let store = f.store.clone();
        let approvals = f.approvals.clone();
        let run_id = f.run_id.clone();
        tokio::spawn(async move {
            loop {
                let pending = store
                    .read(&run_id, |state| {
                        state.approvals.first().map(|a| a.approval_id.clone())
                    })
                    .unwrap();
                if let Some(approval_id) = pending {
                    approvals
                        .resolve(&approval_id, ApprovalResolution::approved())
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let result = f
            .executor
            .execute(&ctx(&f), &call("spawn_node", json!({"alias": "child"})))
            .await;
        assert!(result.ok);
    }

    #[test]
    fn docs_path_classification() {
        let config = Config::default();
        assert!(is_docs_path("README.md", &config));
        assert!(is_docs_path("notes/plan.TXT", &config));
        assert!(is_docs_path("docs/design.rs", &config));
        assert!(!is_docs_path("src/main.rs", &config));
    }
}

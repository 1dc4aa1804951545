//! The node runner — one turn from inbox to artifacts.
//!
//! State machine per turn: Preparing (drain inbox, build prompt, lazy
//! session start) → Sending → Streaming (republish deltas) →
//! AwaitingFinal (extract tool calls) → RunningTools (executor may park
//! the node on an approval) → Completing (footer, artifacts, counters).
//! Interrupts discard further deltas and synthesize an `interrupted`
//! outcome; adapter failures fail the turn but keep the node
//! schedulable.

use std::sync::Arc;

use tokio::sync::mpsc;

use ag_domain::config::Config;
use ag_domain::error::{Error, Result};
use ag_domain::event::TurnOutcome;
use ag_domain::{
    id, ApprovalRequest, ApprovalStatus, Artifact, ArtifactKind, Connection, ConnectionStatus,
    EventKind, GlobalMode, InboxItem, NodePatch, NodeStatus, RunPatch, RunStatus, ToolCall,
    ToolResult, UsageTotals,
};
use ag_providers::{AdapterEvent, PromptKind, ProviderRegistry, TurnRequest};
use ag_store::{ArtifactStore, RunStore};
use ag_tools::CommandSecurity;

use crate::approvals::ApprovalGate;
use crate::executor::{ToolContext, ToolExecutor};
use crate::prompt::{build_prompt, InboxLine, PromptContext, TranscriptEntry};
use crate::sessions::{NodeSession, NodeSessions};
use crate::stall::{StallDetector, TurnSignals};
use crate::templates::TemplateStore;
use crate::verify;

/// Everything a turn needs, shared by the scheduler and the façade.
pub struct RunnerDeps {
    pub config: Arc<Config>,
    pub store: Arc<RunStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub registry: Arc<ProviderRegistry>,
    pub approvals: Arc<ApprovalGate>,
    pub sessions: Arc<NodeSessions>,
    pub stall: Arc<StallDetector>,
    pub templates: Arc<TemplateStore>,
    pub security: Arc<CommandSecurity>,
    pub executor: ToolExecutor,
}

struct TurnSetup {
    turn_id: String,
    session: Arc<NodeSession>,
    prompt_full: String,
    prompt_delta: String,
    prompt_kind: PromptKind,
    header_hash: String,
    inbox_messages: Vec<String>,
    working_dir: std::path::PathBuf,
    global_mode: GlobalMode,
    native_tools: bool,
}

/// Run one turn for a node. Returns the outcome; all observable
/// effects flow through the store as events.
pub async fn run_turn(
    deps: &RunnerDeps,
    run_id: &str,
    node_id: &str,
    continue_tick: bool,
) -> Result<TurnOutcome> {
    let setup = prepare(deps, run_id, node_id, continue_tick).await?;
    tracing::debug!(run_id, node_id, turn_id = %setup.turn_id, "turn started");

    // ── Sending ──────────────────────────────────────────────────────
    let mut receiver = setup
        .session
        .events
        .lock()
        .take()
        .ok_or_else(|| Error::Fatal(format!("node {node_id} already has an active turn")))?;

    let prompt_text = match setup.prompt_kind {
        PromptKind::Full => setup.prompt_full.clone(),
        PromptKind::Delta => setup.prompt_delta.clone(),
    };
    let send_result = setup
        .session
        .adapter
        .send(TurnRequest {
            turn_id: setup.turn_id.clone(),
            prompt: prompt_text,
            prompt_kind: setup.prompt_kind,
        })
        .await;

    if let Err(e) = send_result {
        *setup.session.events.lock() = Some(receiver);
        finish_failed(deps, run_id, node_id, &setup, &e.to_string()).await?;
        return Ok(TurnOutcome::Failed);
    }

    // The prompt is on the wire: remember the header so an unchanged
    // resumed session can take deltas next turn. Runner-internal, no
    // event.
    deps.store.update(run_id, |state| {
        if let Some(node) = state.node_mut(node_id) {
            node.session.prompt_sent = true;
            node.session.header_hash = Some(setup.header_hash.clone());
        }
        Ok(((), vec![]))
    })?;

    deps.store.update(run_id, |state| {
        let patch = NodePatch {
            connection: Some(Connection {
                status: ConnectionStatus::Streaming,
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
    })?;

    // ── Streaming → AwaitingFinal ────────────────────────────────────
    let streamed = stream_until_final(deps, run_id, node_id, &setup, &mut receiver).await;
    *setup.session.events.lock() = Some(receiver);

    let streamed = match streamed {
        StreamEnd::Final(streamed) => streamed,
        StreamEnd::Interrupted => {
            finish_interrupted(deps, run_id, node_id, &setup).await?;
            return Ok(TurnOutcome::Interrupted);
        }
        StreamEnd::Failed(message) => {
            finish_failed(deps, run_id, node_id, &setup, &message).await?;
            return Ok(TurnOutcome::Failed);
        }
    };

    // ── RunningTools ─────────────────────────────────────────────────
    let final_text = streamed
        .final_content
        .unwrap_or_else(|| streamed.text.clone());
    let tool_calls = select_tool_calls(node_id, &streamed.native_calls, &final_text, setup.native_tools);

    let ctx = ToolContext {
        run_id: run_id.to_owned(),
        node_id: node_id.to_owned(),
        turn_id: setup.turn_id.clone(),
    };
    let mut results: Vec<ToolResult> = Vec::new();
    for call in &tool_calls {
        if setup.session.cancel.is_cancelled() {
            finish_interrupted(deps, run_id, node_id, &setup).await?;
            return Ok(TurnOutcome::Interrupted);
        }
        let _ = deps.store.record(
            run_id,
            EventKind::ToolProposed {
                node_id: node_id.to_owned(),
                turn_id: setup.turn_id.clone(),
                call: call.clone(),
            },
        );
        results.push(deps.executor.execute(&ctx, call).await);
    }

    // ── Completing ───────────────────────────────────────────────────
    complete(
        deps,
        run_id,
        node_id,
        &setup,
        final_text,
        tool_calls,
        &results,
        streamed.usage,
    )
    .await?;
    Ok(TurnOutcome::Ok)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Preparing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn prepare(
    deps: &RunnerDeps,
    run_id: &str,
    node_id: &str,
    continue_tick: bool,
) -> Result<TurnSetup> {
    let turn_id = id::new_id(id::TURN);

    // Drain the inbox and flip the node to running under one guard.
    let (run, node, inbox_lines) = deps.store.update(run_id, |state| {
        if state.node(node_id).is_none() {
            return Err(Error::not_found("node", node_id));
        }

        let items = state.drain_inbox(node_id);
        let inbox_lines: Vec<InboxLine> = items
            .iter()
            .map(|item| match item {
                InboxItem::User {
                    content,
                    created_at,
                    ..
                } => InboxLine {
                    sender: "user".into(),
                    at: *created_at,
                    message: content.clone(),
                },
                InboxItem::Handoff { envelope } => InboxLine {
                    sender: state.node_display(&envelope.from_node_id),
                    at: envelope.created_at,
                    message: envelope.payload.message.clone(),
                },
            })
            .collect();

        let patch = NodePatch {
            status: Some(NodeStatus::Running),
            pending_turn: Some(false),
            inbox_count: Some(0),
            ..Default::default()
        };
        let node = state.node_mut(node_id).unwrap();
        patch.apply(node);
        let node = node.clone();

        let mut events = Vec::new();
        if !items.is_empty() {
            events.push(EventKind::InboxConsumed {
                node_id: node_id.to_owned(),
                count: items.len(),
            });
        }
        events.push(EventKind::NodePatch {
            node_id: node_id.to_owned(),
            patch,
        });

        Ok(((state.run.clone(), node, inbox_lines), events))
    })?;

    let role_template = match &node.template {
        Some(name) => match deps.templates.get(name) {
            Ok(content) => Some(content),
            Err(e) => {
                tracing::warn!(template = %name, error = %e, "role template unavailable");
                None
            }
        },
        None => None,
    };

    let session = deps
        .sessions
        .get_or_create(node_id, &node.provider, &deps.registry)?;
    session.cancel.clear();
    session.adapter.start().await?;

    let resume = session.adapter.supports_resume();
    let history: Vec<TranscriptEntry> = if resume {
        Vec::new()
    } else {
        session.transcript_tail()
    };

    let prompt = build_prompt(&PromptContext {
        run: &run,
        node: &node,
        role_template: role_template.as_deref(),
        inbox: &inbox_lines,
        history: &history,
        continue_tick,
    });

    let prompt_kind = if resume
        && node.session.prompt_sent
        && node.session.header_hash.as_deref() == Some(prompt.header_hash.as_str())
    {
        PromptKind::Delta
    } else {
        PromptKind::Full
    };

    Ok(TurnSetup {
        turn_id,
        session,
        header_hash: prompt.header_hash,
        prompt_full: prompt.full,
        prompt_delta: prompt.delta,
        prompt_kind,
        inbox_messages: inbox_lines
            .iter()
            .map(|line| format!("{}: {}", line.sender, line.message))
            .collect(),
        working_dir: run.working_dir.clone(),
        global_mode: run.global_mode,
        native_tools: deps
            .registry
            .config_for(&node.provider)
            .map(|c| c.native_tools)
            .unwrap_or(false),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Streamed {
    text: String,
    final_content: Option<String>,
    native_calls: Vec<ToolCall>,
    usage: UsageTotals,
}

enum StreamEnd {
    Final(Streamed),
    Interrupted,
    Failed(String),
}

async fn stream_until_final(
    deps: &RunnerDeps,
    run_id: &str,
    node_id: &str,
    setup: &TurnSetup,
    receiver: &mut mpsc::Receiver<AdapterEvent>,
) -> StreamEnd {
    let mut text = String::new();
    let mut usage = UsageTotals::default();

    loop {
        // Deltas arriving after an interrupt are discarded, not
        // republished.
        if setup.session.cancel.is_cancelled() {
            return StreamEnd::Interrupted;
        }

        let Some(event) = receiver.recv().await else {
            return StreamEnd::Failed("adapter event stream closed".into());
        };
        if setup.session.cancel.is_cancelled() {
            return StreamEnd::Interrupted;
        }

        match event {
            AdapterEvent::SessionAnnounced { session_id } => {
                let patch = NodePatch::session_id(&session_id);
                let _ = deps.store.update(run_id, |state| {
                    if let Some(node) = state.node_mut(node_id) {
                        patch.apply(node);
                    }
                    Ok((
                        (),
                        vec![EventKind::NodePatch {
                            node_id: node_id.to_owned(),
                            patch: patch.clone(),
                        }],
                    ))
                });
            }
            AdapterEvent::AssistantDelta { text: delta } => {
                text.push_str(&delta);
                let _ = deps.store.record(
                    run_id,
                    EventKind::AssistantDelta {
                        node_id: node_id.to_owned(),
                        turn_id: setup.turn_id.clone(),
                        text: delta,
                    },
                );
            }
            AdapterEvent::ThinkingDelta { text: delta } => {
                let _ = deps.store.record(
                    run_id,
                    EventKind::ThinkingDelta {
                        node_id: node_id.to_owned(),
                        turn_id: setup.turn_id.clone(),
                        text: delta,
                    },
                );
            }
            AdapterEvent::ThinkingFinal { content } => {
                let _ = deps.store.record(
                    run_id,
                    EventKind::ThinkingFinal {
                        node_id: node_id.to_owned(),
                        turn_id: setup.turn_id.clone(),
                        content,
                    },
                );
            }
            AdapterEvent::Usage(u) => usage.add(&u),
            AdapterEvent::Console { stream, text } => {
                let _ = deps.store.record(
                    run_id,
                    EventKind::ConsoleChunk {
                        node_id: node_id.to_owned(),
                        stream,
                        text,
                    },
                );
            }
            AdapterEvent::ApprovalRequested {
                approval_id,
                tool,
                context,
            } => {
                // Provider-native approval: track it so the resolve API
                // can route the reply back to the adapter.
                let request = ApprovalRequest {
                    approval_id: approval_id.clone(),
                    run_id: run_id.to_owned(),
                    node_id: node_id.to_owned(),
                    tool,
                    context,
                    created_at: chrono::Utc::now(),
                    deadline_at: None,
                };
                deps.approvals
                    .insert_native(&approval_id, setup.session.adapter.clone());
                let _ = deps.store.update(run_id, |state| {
                    state.approvals.push(request.clone());
                    let patch = NodePatch::status(NodeStatus::Blocked);
                    if let Some(node) = state.node_mut(node_id) {
                        patch.apply(node);
                    }
                    Ok((
                        (),
                        vec![
                            EventKind::ApprovalRequested {
                                approval: request.clone(),
                            },
                            EventKind::NodePatch {
                                node_id: node_id.to_owned(),
                                patch,
                            },
                        ],
                    ))
                });
            }
            AdapterEvent::ApprovalResolved {
                approval_id,
                approved,
            } => {
                let status = if approved {
                    ApprovalStatus::Approved
                } else {
                    ApprovalStatus::Denied
                };
                let _ = deps.store.update(run_id, |state| {
                    state.approvals.retain(|a| a.approval_id != approval_id);
                    let patch = NodePatch::status(NodeStatus::Running);
                    if let Some(node) = state.node_mut(node_id) {
                        patch.apply(node);
                    }
                    Ok((
                        (),
                        vec![
                            EventKind::ApprovalResolved {
                                approval_id: approval_id.clone(),
                                node_id: node_id.to_owned(),
                                status,
                                feedback: None,
                            },
                            EventKind::NodePatch {
                                node_id: node_id.to_owned(),
                                patch,
                            },
                        ],
                    ))
                });
            }
            AdapterEvent::TurnFailed { message } => return StreamEnd::Failed(message),
            AdapterEvent::Closed => {
                return StreamEnd::Failed("provider session closed mid-turn".into());
            }
            AdapterEvent::AssistantFinal {
                content,
                tool_calls,
            } => {
                return StreamEnd::Final(Streamed {
                    text,
                    final_content: content,
                    native_calls: tool_calls,
                    usage,
                });
            }
        }
    }
}

/// Native tool calls win; embedded JSON-line calls are parsed from the
/// final text and used only when no native calls arrived.
fn select_tool_calls(
    node_id: &str,
    native: &[ToolCall],
    final_text: &str,
    native_tools: bool,
) -> Vec<ToolCall> {
    let embedded = ag_domain::tool::parse_embedded_tool_calls(final_text);
    if !native.is_empty() {
        if !embedded.is_empty() {
            tracing::warn!(
                node_id,
                discarded = embedded.len(),
                "native tool calls present; discarding embedded tool_call lines"
            );
        }
        return native.to_vec();
    }
    if native_tools && !embedded.is_empty() {
        tracing::debug!(node_id, "provider advertises native tools but sent embedded calls");
    }
    embedded
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Completing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn complete(
    deps: &RunnerDeps,
    run_id: &str,
    node_id: &str,
    setup: &TurnSetup,
    final_text: String,
    tool_calls: Vec<ToolCall>,
    results: &[ToolResult],
    turn_usage: UsageTotals,
) -> Result<()> {
    let final_text = append_tool_errors(final_text, results);

    let _ = deps.store.record(
        run_id,
        EventKind::AssistantFinal {
            node_id: node_id.to_owned(),
            turn_id: setup.turn_id.clone(),
            content: final_text.clone(),
            tool_calls,
        },
    );

    // Artifacts: the prompt that drove the turn, the resulting diff
    // (possibly empty), and the turn transcript.
    record_artifact(
        deps,
        run_id,
        node_id,
        ArtifactKind::Prompt,
        &format!("{}-prompt.md", setup.turn_id),
        setup.prompt_full.as_bytes(),
    )
    .await?;

    let diff = verify::capture_diff(&setup.working_dir, &deps.config.tools.exec).await;
    record_artifact(
        deps,
        run_id,
        node_id,
        ArtifactKind::Diff,
        &format!("{}.diff", setup.turn_id),
        diff.as_bytes(),
    )
    .await?;

    let transcript_body = render_transcript(&setup.inbox_messages, &final_text);
    record_artifact(
        deps,
        run_id,
        node_id,
        ArtifactKind::Transcript,
        &format!("{}-transcript.md", setup.turn_id),
        transcript_body.as_bytes(),
    )
    .await?;

    // Post-turn verification feeds the stall detector.
    let verification_failure = if setup.global_mode == GlobalMode::Implementation
        && !deps.config.verification.commands.is_empty()
    {
        verify::run_verification(
            &deps.config.verification.commands,
            &setup.working_dir,
            &deps.config.tools.exec,
            deps.security.as_ref(),
        )
        .await
    } else {
        None
    };

    let summary = summarize(&final_text, verification_failure.as_deref());
    let stalled = deps.stall.observe(
        node_id,
        TurnSignals {
            output: final_text.clone(),
            diff,
            verification_failure,
            summary: summary.clone(),
        },
    );

    // Transcript tail for replay fallback.
    let mut entries: Vec<TranscriptEntry> = setup
        .inbox_messages
        .iter()
        .map(|message| TranscriptEntry {
            role: "user".into(),
            text: message.clone(),
        })
        .collect();
    entries.push(TranscriptEntry {
        role: "assistant".into(),
        text: final_text.clone(),
    });
    setup.session.push_transcript(entries);

    // Counters, status, usage.
    deps.store.update(run_id, |state| {
        let mut events = Vec::new();

        if !turn_usage.is_empty() {
            events.push(EventKind::TelemetryUsage {
                node_id: Some(node_id.to_owned()),
                usage: turn_usage,
            });
        }

        let node_patch = {
            let node = state
                .node_mut(node_id)
                .ok_or_else(|| Error::not_found("node", node_id))?;
            node.usage.add(&turn_usage);
            let patch = NodePatch {
                status: Some(NodeStatus::Idle),
                summary: Some(summary.clone()),
                connection: Some(Connection {
                    status: ConnectionStatus::Idle,
                    last_heartbeat_at: Some(chrono::Utc::now()),
                }),
                usage: Some(node.usage),
                completed_turns: Some(node.completed_turns + 1),
                ..Default::default()
            };
            patch.apply(node);
            patch
        };
        events.push(EventKind::NodePatch {
            node_id: node_id.to_owned(),
            patch: node_patch,
        });

        let mut run_usage = state.run.usage;
        run_usage.add(&turn_usage);
        let run_patch = RunPatch {
            usage: Some(run_usage),
            total_turns: Some(state.run.total_turns + 1),
            ..Default::default()
        };
        run_patch.apply(&mut state.run);
        events.push(EventKind::RunPatch { patch: run_patch });

        events.push(EventKind::TurnCompleted {
            node_id: node_id.to_owned(),
            turn_id: setup.turn_id.clone(),
            outcome: TurnOutcome::Ok,
        });

        if let Some(evidence) = &stalled {
            let pause = RunPatch::status(RunStatus::Paused);
            pause.apply(&mut state.run);
            events.push(EventKind::RunStalled {
                evidence: evidence.clone(),
            });
            events.push(EventKind::RunPatch { patch: pause });
        }

        Ok(((), events))
    })?;

    Ok(())
}

async fn finish_interrupted(
    deps: &RunnerDeps,
    run_id: &str,
    node_id: &str,
    setup: &TurnSetup,
) -> Result<()> {
    tracing::debug!(run_id, node_id, turn_id = %setup.turn_id, "turn interrupted");
    deps.store.update(run_id, |state| {
        let patch = idle_patch();
        if let Some(node) = state.node_mut(node_id) {
            patch.apply(node);
        }
        Ok((
            (),
            vec![
                EventKind::TurnCompleted {
                    node_id: node_id.to_owned(),
                    turn_id: setup.turn_id.clone(),
                    outcome: TurnOutcome::Interrupted,
                },
                EventKind::NodePatch {
                    node_id: node_id.to_owned(),
                    patch,
                },
            ],
        ))
    })?;
    Ok(())
}

async fn finish_failed(
    deps: &RunnerDeps,
    run_id: &str,
    node_id: &str,
    setup: &TurnSetup,
    message: &str,
) -> Result<()> {
    tracing::warn!(run_id, node_id, turn_id = %setup.turn_id, error = %message, "turn failed");

    // The prompt is still persisted so the failure can be inspected.
    record_artifact(
        deps,
        run_id,
        node_id,
        ArtifactKind::Prompt,
        &format!("{}-prompt.md", setup.turn_id),
        setup.prompt_full.as_bytes(),
    )
    .await?;

    deps.store.update(run_id, |state| {
        let patch = idle_patch();
        if let Some(node) = state.node_mut(node_id) {
            patch.apply(node);
        }
        Ok((
            (),
            vec![
                EventKind::TurnCompleted {
                    node_id: node_id.to_owned(),
                    turn_id: setup.turn_id.clone(),
                    outcome: TurnOutcome::Failed,
                },
                EventKind::NodeProgress {
                    node_id: node_id.to_owned(),
                    summary: format!("turn failed: {message}"),
                },
                EventKind::NodePatch {
                    node_id: node_id.to_owned(),
                    patch,
                },
            ],
        ))
    })?;
    Ok(())
}

fn idle_patch() -> NodePatch {
    NodePatch {
        status: Some(NodeStatus::Idle),
        connection: Some(Connection {
            status: ConnectionStatus::Idle,
            last_heartbeat_at: Some(chrono::Utc::now()),
        }),
        ..Default::default()
    }
}

async fn record_artifact(
    deps: &RunnerDeps,
    run_id: &str,
    node_id: &str,
    kind: ArtifactKind,
    name: &str,
    content: &[u8],
) -> Result<Artifact> {
    let artifact = Artifact::new(run_id, node_id, kind, name);
    let artifact = deps.artifacts.write(artifact, content).await?;
    deps.store.update(run_id, |state| {
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

/// Failed tool results land in the transcript so the model can react
/// next turn.
fn append_tool_errors(final_text: String, results: &[ToolResult]) -> String {
    let errors: Vec<String> = results
        .iter()
        .filter(|r| !r.ok)
        .map(|r| {
            format!(
                "- {}: {}",
                r.name,
                r.error.as_deref().unwrap_or("failed")
            )
        })
        .collect();
    if errors.is_empty() {
        return final_text;
    }
    format!("{final_text}\n\nTool errors:\n{}", errors.join("\n"))
}

fn summarize(final_text: &str, verification_failure: Option<&str>) -> String {
    let base = final_text
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim();
    let summary = match verification_failure {
        Some(failure) => format!("{base} [verification failing: {failure}]"),
        None => base.to_owned(),
    };
    summary.chars().take(ag_domain::node::SUMMARY_MAX_CHARS).collect()
}

fn render_transcript(inbox_messages: &[String], final_text: &str) -> String {
    let mut body = String::new();
    for message in inbox_messages {
        body.push_str("## Input\n");
        body.push_str(message);
        body.push_str("\n\n");
    }
    body.push_str("## Assistant\n");
    body.push_str(final_text);
    body.push('\n');
    body
}

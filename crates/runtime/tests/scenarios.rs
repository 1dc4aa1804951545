//! End-to-end runtime scenarios against the mock transport: echo,
//! gated tools, handoff routing, provider switch, stall detection, and
//! crash recovery.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;

use ag_domain::config::Config;
use ag_domain::{
    ApprovalResolution, ConnectionStatus, Event, EventKind, GlobalMode, NodeStatus,
    OrchestrationMode, RunStatus,
};
use ag_providers::MockTurn;
use ag_runtime::{
    CreateNodeParams, CreateRunParams, PostMessageParams, Runtime, UpdateNodeParams,
    UpdateRunParams,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    runtime: Runtime,
    _data_dir: tempfile::TempDir,
    workspace: tempfile::TempDir,
}

fn harness_with(tune: impl FnOnce(&mut Config)) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let mut config = Config {
        data_dir: data_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.orchestration.max_iterations = 5;
    tune(&mut config);

    Harness {
        runtime: Runtime::new(config).unwrap(),
        _data_dir: data_dir,
        workspace,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn run_params(workspace: &tempfile::TempDir, mode: OrchestrationMode) -> CreateRunParams {
    CreateRunParams {
        working_dir: workspace.path().to_path_buf(),
        mode: Some(mode),
        global_mode: Some(GlobalMode::Implementation),
        layout: None,
    }
}

fn node_params(label: &str) -> CreateNodeParams {
    let mut capabilities = ag_domain::Capabilities::default();
    capabilities.write_code = true;
    capabilities.run_commands = true;
    CreateNodeParams {
        label: label.into(),
        provider: "mock".into(),
        alias: None,
        template: None,
        system_prompt: None,
        capabilities: Some(capabilities),
        permissions: None,
    }
}

async fn next_matching(
    rx: &mut broadcast::Receiver<Event>,
    what: &str,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event bus closed while waiting for {what}")
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_turn_completed(rx: &mut broadcast::Receiver<Event>, node_id: &str) {
    let node_id = node_id.to_owned();
    next_matching(rx, "turn.completed", move |e| {
        matches!(&e.kind, EventKind::TurnCompleted { node_id: n, .. } if n == &node_id)
    })
    .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1 — single-node echo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn single_node_echo() {
    let h = harness();
    let run = h
        .runtime
        .create_run(run_params(&h.workspace, OrchestrationMode::Auto))
        .unwrap();
    let mut rx = h.runtime.subscribe_run(&run.id);
    let node = h.runtime.create_node(&run.id, node_params("echoer")).unwrap();

    h.runtime
        .post_message(
            &run.id,
            PostMessageParams {
                content: "hello".into(),
                node_id: Some(node.id.clone()),
                interrupt: false,
            },
        )
        .await
        .unwrap();

    // message.user precedes the streaming of its own turn.
    next_matching(&mut rx, "message.user", |e| {
        matches!(&e.kind, EventKind::UserMessage { content, .. } if content == "hello")
    })
    .await;
    next_matching(&mut rx, "assistant delta", |e| {
        matches!(&e.kind, EventKind::AssistantDelta { text, .. } if text.contains("hello"))
    })
    .await;
    next_matching(&mut rx, "assistant final", |e| {
        matches!(&e.kind, EventKind::AssistantFinal { content, .. } if content == "hello")
    })
    .await;

    // Every completed turn records a prompt and a diff artifact.
    next_matching(&mut rx, "prompt artifact", |e| {
        matches!(&e.kind, EventKind::ArtifactCreated { artifact }
            if artifact.kind == ag_domain::ArtifactKind::Prompt)
    })
    .await;
    next_matching(&mut rx, "diff artifact", |e| {
        matches!(&e.kind, EventKind::ArtifactCreated { artifact }
            if artifact.kind == ag_domain::ArtifactKind::Diff)
    })
    .await;
    wait_turn_completed(&mut rx, &node.id).await;

    let node = h.runtime.get_node(&run.id, &node.id).unwrap();
    assert_eq!(node.status, NodeStatus::Idle);
    assert_eq!(node.inbox_count, 0);
    assert!(node.completed_turns >= 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2 — gated shell tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn gated_shell_tool_waits_for_approval() {
    let h = harness();
    let run = h
        .runtime
        .create_run(run_params(&h.workspace, OrchestrationMode::Interactive))
        .unwrap();
    let mut rx = h.runtime.subscribe_run(&run.id);

    let mut params = node_params("gated");
    params.permissions = Some(ag_domain::Permissions {
        cli_permissions_mode: ag_domain::CliPermissionsMode::Gated,
        agent_management_requires_approval: false,
    });
    let node = h.runtime.create_node(&run.id, params).unwrap();

    h.runtime.registry().mock_script("mock").push(MockTurn::text(
        r#"{"tool_call":{"id":"t1","name":"command","args":{"cmd":"echo hi"}}}"#,
    ));

    h.runtime
        .post_message(
            &run.id,
            PostMessageParams {
                content: "run it".into(),
                node_id: Some(node.id.clone()),
                interrupt: false,
            },
        )
        .await
        .unwrap();

    next_matching(&mut rx, "tool.proposed", |e| {
        matches!(&e.kind, EventKind::ToolProposed { call, .. } if call.id == "t1")
    })
    .await;
    let requested = next_matching(&mut rx, "approval.requested", |e| {
        matches!(&e.kind, EventKind::ApprovalRequested { .. })
    })
    .await;
    let EventKind::ApprovalRequested { approval } = requested.kind else {
        unreachable!()
    };

    // Parked on the approval: the node is blocked.
    let blocked = h.runtime.get_node(&run.id, &node.id).unwrap();
    assert_eq!(blocked.status, NodeStatus::Blocked);
    assert_eq!(h.runtime.list_approvals(&run.id).unwrap().len(), 1);

    h.runtime
        .resolve_approval(&run.id, &approval.approval_id, ApprovalResolution::approved())
        .await
        .unwrap();

    next_matching(&mut rx, "approval.resolved", |e| {
        matches!(&e.kind, EventKind::ApprovalResolved { status, .. }
            if *status == ag_domain::ApprovalStatus::Approved)
    })
    .await;
    next_matching(&mut rx, "tool.started", |e| {
        matches!(&e.kind, EventKind::ToolStarted { call_id, .. } if call_id == "t1")
    })
    .await;
    next_matching(&mut rx, "tool.completed", |e| {
        matches!(&e.kind, EventKind::ToolCompleted { call_id, ok: true, output: Some(out), .. }
            if call_id == "t1" && out == "hi\n")
    })
    .await;
    next_matching(&mut rx, "assistant final", |e| {
        matches!(&e.kind, EventKind::AssistantFinal { .. })
    })
    .await;
    wait_turn_completed(&mut rx, &node.id).await;

    let node = h.runtime.get_node(&run.id, &node.id).unwrap();
    assert_eq!(node.status, NodeStatus::Idle);
    assert!(h.runtime.list_approvals(&run.id).unwrap().is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3 — handoff routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn handoff_reactivates_the_target_node() {
    let h = harness();
    let run = h
        .runtime
        .create_run(run_params(&h.workspace, OrchestrationMode::Interactive))
        .unwrap();
    let mut rx = h.runtime.subscribe_run(&run.id);

    let mut a_params = node_params("A");
    a_params.alias = Some("A".into());
    let a = h.runtime.create_node(&run.id, a_params).unwrap();
    let mut b_params = node_params("B");
    b_params.alias = Some("B".into());
    let b = h.runtime.create_node(&run.id, b_params).unwrap();

    h.runtime
        .create_edge(
            &run.id,
            ag_runtime::facade::CreateEdgeParams {
                from: "A".into(),
                to: "B".into(),
                bidirectional: true,
                edge_type: ag_domain::EdgeType::Handoff,
                label: String::new(),
            },
        )
        .unwrap();

    h.runtime.registry().mock_script("mock").push(MockTurn::text(
        r#"{"tool_call":{"name":"send_handoff","args":{"to":"B","message":"please verify"}}}"#,
    ));

    h.runtime
        .post_message(
            &run.id,
            PostMessageParams {
                content: "start".into(),
                node_id: Some("A".into()),
                interrupt: false,
            },
        )
        .await
        .unwrap();

    let sent = next_matching(&mut rx, "handoff.sent", |e| {
        matches!(&e.kind, EventKind::HandoffSent { .. })
    })
    .await;
    let EventKind::HandoffSent { envelope } = sent.kind else {
        unreachable!()
    };
    assert_eq!(envelope.from_node_id, a.id);
    assert_eq!(envelope.to_node_id, b.id);
    assert_eq!(envelope.payload.message, "please verify");

    // B consumes the envelope on its own — the scheduler reactivates
    // it without any user input. The echo turn proves the prompt
    // carried the handoff message with its provenance.
    next_matching(&mut rx, "B final", |e| {
        matches!(&e.kind, EventKind::AssistantFinal { node_id, content, .. }
            if node_id == &b.id && content == "please verify")
    })
    .await;
    wait_turn_completed(&mut rx, &b.id).await;

    let b = h.runtime.get_node(&run.id, &b.id).unwrap();
    assert_eq!(b.inbox_count, 0);
    assert_eq!(b.status, NodeStatus::Idle);
}

#[tokio::test]
async fn handoff_without_edge_is_rejected() {
    let h = harness();
    let run = h
        .runtime
        .create_run(run_params(&h.workspace, OrchestrationMode::Interactive))
        .unwrap();
    let mut rx = h.runtime.subscribe_run(&run.id);

    let mut a_params = node_params("A");
    a_params.alias = Some("A".into());
    h.runtime.create_node(&run.id, a_params).unwrap();
    let mut b_params = node_params("B");
    b_params.alias = Some("B".into());
    let b = h.runtime.create_node(&run.id, b_params).unwrap();

    // No edge between A and B.
    h.runtime.registry().mock_script("mock").push(MockTurn::text(
        r#"{"tool_call":{"name":"send_handoff","args":{"to":"B","message":"psst"}}}"#,
    ));
    h.runtime
        .post_message(
            &run.id,
            PostMessageParams {
                content: "go".into(),
                node_id: Some("A".into()),
                interrupt: false,
            },
        )
        .await
        .unwrap();

    next_matching(&mut rx, "tool error", |e| {
        matches!(&e.kind, EventKind::ToolCompleted { ok: false, error: Some(err), .. }
            if err.contains("no edge permits"))
    })
    .await;

    let b = h.runtime.get_node(&run.id, &b.id).unwrap();
    assert_eq!(b.inbox_count, 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4 — provider switch resets the session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn provider_switch_resets_session() {
    let h = harness();
    let run = h
        .runtime
        .create_run(run_params(&h.workspace, OrchestrationMode::Interactive))
        .unwrap();
    let mut rx = h.runtime.subscribe_run(&run.id);
    let node = h.runtime.create_node(&run.id, node_params("switcher")).unwrap();

    h.runtime
        .post_message(
            &run.id,
            PostMessageParams {
                content: "first".into(),
                node_id: Some(node.id.clone()),
                interrupt: false,
            },
        )
        .await
        .unwrap();
    wait_turn_completed(&mut rx, &node.id).await;

    let before = h.runtime.get_node(&run.id, &node.id).unwrap();
    let old_session = before.session.id.clone().expect("session announced");
    assert!(before.session.prompt_sent);

    // Switch providers: session state resets, connection drops.
    h.runtime
        .update_node(
            &run.id,
            &node.id,
            UpdateNodeParams {
                provider: Some("mock2".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let switched = h.runtime.get_node(&run.id, &node.id).unwrap();
    assert_eq!(switched.provider, "mock2");
    assert_eq!(switched.connection.status, ConnectionStatus::Disconnected);
    assert!(switched.session.id.is_none());
    assert!(!switched.session.prompt_sent);

    // Next turn runs against the new provider and announces a fresh
    // session id via node.patch.
    h.runtime
        .post_message(
            &run.id,
            PostMessageParams {
                content: "second".into(),
                node_id: Some(node.id.clone()),
                interrupt: false,
            },
        )
        .await
        .unwrap();
    next_matching(&mut rx, "new session patch", |e| {
        matches!(&e.kind, EventKind::NodePatch { patch, .. } if patch.session_id.is_some())
    })
    .await;
    wait_turn_completed(&mut rx, &node.id).await;

    let after = h.runtime.get_node(&run.id, &node.id).unwrap();
    let new_session = after.session.id.clone().expect("new session announced");
    assert_ne!(new_session, old_session);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 5 — stall pauses the run, resume clears it
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn repeated_output_stalls_and_resume_recovers() {
    let h = harness_with(|config| config.stall_detection.threshold = 3);
    let run = h
        .runtime
        .create_run(run_params(&h.workspace, OrchestrationMode::Interactive))
        .unwrap();
    let mut rx = h.runtime.subscribe_run(&run.id);
    let node = h.runtime.create_node(&run.id, node_params("looper")).unwrap();

    let script = h.runtime.registry().mock_script("mock");
    for _ in 0..3 {
        script.push(MockTurn::text("stuck"));
    }

    for n in 0..3 {
        h.runtime
            .post_message(
                &run.id,
                PostMessageParams {
                    content: format!("poke {n}"),
                    node_id: Some(node.id.clone()),
                    interrupt: false,
                },
            )
            .await
            .unwrap();
        wait_turn_completed(&mut rx, &node.id).await;
    }

    let stalled = next_matching(&mut rx, "run.stalled", |e| {
        matches!(&e.kind, EventKind::RunStalled { .. })
    })
    .await;
    let EventKind::RunStalled { evidence } = stalled.kind else {
        unreachable!()
    };
    assert_eq!(evidence.node_id, node.id);
    assert!(evidence.output_hash.is_some());
    assert_eq!(evidence.repeats, 3);
    assert!(evidence.summaries.iter().any(|s| s.contains("stuck")));

    assert_eq!(h.runtime.get_run(&run.id).unwrap().status, RunStatus::Paused);

    // Resume clears the counters and the run keeps going.
    h.runtime
        .update_run(
            &run.id,
            UpdateRunParams {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(h.runtime.get_run(&run.id).unwrap().status, RunStatus::Running);

    // Two more identical turns stay under the fresh threshold.
    script.push(MockTurn::text("stuck"));
    script.push(MockTurn::text("stuck"));
    for n in 0..2 {
        h.runtime
            .post_message(
                &run.id,
                PostMessageParams {
                    content: format!("again {n}"),
                    node_id: Some(node.id.clone()),
                    interrupt: false,
                },
            )
            .await
            .unwrap();
        wait_turn_completed(&mut rx, &node.id).await;
    }
    assert_eq!(h.runtime.get_run(&run.id).unwrap().status, RunStatus::Running);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6 — crash recovery from the event log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn crash_recovery_demotes_and_recounts() {
    use ag_domain::{Event, Node, Run};
    use ag_store::event_log::EventLog;

    let data_dir = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();

    // Forge a crashed run: 50+ events on disk, no snapshot.
    let mut run = Run::new(
        workspace.path().to_path_buf(),
        OrchestrationMode::Auto,
        GlobalMode::Implementation,
    );
    run.status = RunStatus::Running;
    let run_id = run.id.clone();

    let mut node = Node::new(&run_id, "worker", "mock");
    node.status = NodeStatus::Running;
    node.connection.status = ConnectionStatus::Streaming;
    let node_id = node.id.clone();

    let log = EventLog::open(
        data_dir
            .path()
            .join("runs")
            .join(&run_id)
            .join("events.ndjson"),
    );
    log.append(&Event::new(&run_id, EventKind::RunCreated { run }))
        .unwrap();
    log.append(&Event::new(&run_id, EventKind::NodeCreated { node }))
        .unwrap();
    log.append(&Event::new(
        &run_id,
        EventKind::UserMessage {
            node_id: node_id.clone(),
            message_id: "msg_1".into(),
            content: "pending work".into(),
        },
    ))
    .unwrap();
    for n in 0..50 {
        log.append(&Event::new(
            &run_id,
            EventKind::AssistantDelta {
                node_id: node_id.clone(),
                turn_id: "turn_1".into(),
                text: format!("chunk {n}"),
            },
        ))
        .unwrap();
    }

    // "Restart" the daemon.
    let config = Config {
        data_dir: data_dir.path().to_path_buf(),
        ..Config::default()
    };
    let runtime = Runtime::new(config).unwrap();
    let mut rx = runtime.subscribe();
    assert_eq!(runtime.recover(), 1);

    let run = runtime.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Paused);

    let node = runtime.get_node(&run_id, &node_id).unwrap();
    assert_eq!(node.status, NodeStatus::Idle);
    assert_eq!(node.connection.status, ConnectionStatus::Disconnected);
    assert_eq!(node.inbox_count, 1);

    // Recovery emits no synthetic backfill; history is explicit via
    // the paginated fetch.
    assert!(rx.try_recv().is_err());
    let page = runtime.get_events(&run_id, None, 10).unwrap();
    assert_eq!(page.events.len(), 10);
    assert!(page.has_more);

    runtime.shutdown().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auto-mode iteration budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn auto_run_completes_at_iteration_budget() {
    let h = harness_with(|config| config.orchestration.max_iterations = 2);
    let run = h
        .runtime
        .create_run(run_params(&h.workspace, OrchestrationMode::Auto))
        .unwrap();
    let mut rx = h.runtime.subscribe_run(&run.id);
    h.runtime.create_node(&run.id, node_params("worker")).unwrap();

    // Continue ticks drive the node until the budget completes the run.
    next_matching(&mut rx, "run completed", |e| {
        matches!(&e.kind, EventKind::RunPatch { patch }
            if patch.status == Some(RunStatus::Completed))
    })
    .await;

    let run = h.runtime.get_run(&run.id).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.total_turns >= 2);
}

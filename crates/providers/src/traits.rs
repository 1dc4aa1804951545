//! The adapter contract.

use serde_json::Value;

use ag_domain::error::Result;
use ag_domain::event::ConsoleStream;
use ag_domain::{ApprovalResolution, ToolCall, UsageTotals};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// The whole assembled prompt (first turn, or the header changed).
    Full,
    /// Only the new inbox/instruction block (resumed session).
    Delta,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub turn_id: String,
    pub prompt: String,
    pub prompt_kind: PromptKind,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canonical adapter events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What an adapter reports back while (and between) turns. The node
/// runner republishes these as run events.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// The provider announced (or rotated) its opaque session id.
    SessionAnnounced { session_id: String },
    AssistantDelta { text: String },
    /// End of the assistant message. `content = None` means "use the
    /// accumulated deltas". Native tool calls ride along when the
    /// provider reports them.
    AssistantFinal {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    /// Reasoning stream, kept separate from the main content stream.
    ThinkingDelta { text: String },
    ThinkingFinal { content: String },
    /// Provider-native approval flow (e.g. a CLI asking permission).
    ApprovalRequested {
        approval_id: String,
        tool: String,
        context: Value,
    },
    ApprovalResolved { approval_id: String, approved: bool },
    Usage(UsageTotals),
    /// Raw child-process output that is not part of the protocol.
    Console { stream: ConsoleStream, text: String },
    /// The turn cannot complete (transport failure, nonzero exit).
    TurnFailed { message: String },
    /// The underlying session/process is gone.
    Closed,
}

/// Adapters push events into this bounded channel; the node runner
/// owns the receiving half.
pub type EventSink = tokio::sync::mpsc::Sender<AdapterEvent>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One supervised assistant program. The node runner exclusively owns
/// its adapter session; lifecycle is `start` → `send`* → `close`.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Bring the session up (spawn the child, open the client).
    /// Idempotent: starting a started adapter is a no-op.
    async fn start(&self) -> Result<()>;

    /// Tear the session down unconditionally.
    async fn close(&self);

    /// Enqueue one turn's input. Events stream back via the sink.
    async fn send(&self, turn: TurnRequest) -> Result<()>;

    /// Abort the current turn, best-effort. Deltas already emitted are
    /// retained by the caller.
    async fn interrupt(&self);

    /// Forward a provider-native approval reply.
    async fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: &ApprovalResolution,
    ) -> Result<()>;

    /// Drop provider-side conversation state.
    async fn reset_session(&self) -> Result<()>;

    /// The opaque provider session identifier, once announced.
    fn session_id(&self) -> Option<String>;

    /// Whether later turns may send `PromptKind::Delta`. Stateless
    /// protocols answer false regardless of configuration.
    fn supports_resume(&self) -> bool;

    /// Transcript pairs to replay into prompts when resume is
    /// unsupported.
    fn replay_turns(&self) -> usize;

    /// Whether the provider reports structured tool calls natively.
    fn native_tools(&self) -> bool;
}

//! Provider adapters.
//!
//! Each adapter wraps one external assistant program — a long-lived
//! CLI, a spawn-per-turn CLI with structured output, an HTTP+SSE
//! backend, or the in-process mock — and normalizes its output into
//! canonical [`AdapterEvent`]s for the node runner.

pub mod api;
pub mod cli_stateful;
pub mod cli_stream_json;
pub mod mock;
pub mod normalize;
pub mod registry;
pub mod sse;
pub mod traits;

pub use mock::{MockScript, MockTurn};
pub use registry::ProviderRegistry;
pub use traits::{AdapterEvent, EventSink, PromptKind, ProviderAdapter, TurnRequest};

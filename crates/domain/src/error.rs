/// Shared error type used across all AgentGrid crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    /// Not a failure — the turn is suspended until the approval resolves.
    #[error("approval required: {approval_id}")]
    ApprovalRequired { approval_id: String },

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("tool: {0}")]
    ToolExecution(String),

    #[error("stalled: {0}")]
    Stalled(String),

    #[error("config: {0}")]
    Config(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

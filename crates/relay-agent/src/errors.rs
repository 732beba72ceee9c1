use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the relay-agent crate.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid manifest '{}': {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    #[error("subagent limit reached for conversation '{conversation_id}' ({limit})")]
    SubagentLimit {
        conversation_id: String,
        limit: usize,
    },
    #[error("unknown subagent run: {0}")]
    UnknownRun(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error(transparent)]
    Lane(#[from] LaneError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failure delivered through a lane ticket instead of the task's own output.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LaneError {
    #[error("task was discarded before it started")]
    Discarded,
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

//! Error types for the Tidegate state store client.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur talking to the coordination store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid store address: {0}")]
    InvalidAddress(String),

    #[error("request error: {0}")]
    Request(String),

    #[error("unexpected status {status} from store: {body}")]
    Status { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("version conflict writing {key}: expected {expected:?}")]
    VersionConflict { key: String, expected: Option<u64> },
}

impl StateError {
    /// Whether the caller should re-read, re-decide, and re-write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::VersionConflict { .. })
    }
}

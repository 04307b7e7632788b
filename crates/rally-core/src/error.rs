//! Rally error taxonomy.

use thiserror::Error;

/// Errors returned by every Rally operation.
///
/// `NotFound`, `InvalidState` and `Conflict` are ordinary outcomes a caller is
/// expected to branch on. `Persistence` means the store rejected a write and
/// nothing was changed; callers may retry it with backoff.
#[derive(Debug, Error)]
pub enum RallyError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RallyError {
    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RallyError::NotFound(_) => "not_found",
            RallyError::InvalidState(_) => "invalid_state",
            RallyError::Conflict(_) => "conflict",
            RallyError::Persistence(_) => "persistence",
            RallyError::Config(_) => "config",
            RallyError::Io(_) => "io",
            RallyError::Serialization(_) => "serialization",
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RallyError::Persistence(_) | RallyError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, RallyError>;

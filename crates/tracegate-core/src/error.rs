use crate::session::{SessionId, SessionState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the resource governor refused to admit a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("too many concurrent sessions (limit {limit})")]
    TooManyConcurrentSessions { limit: usize },

    #[error("too many concurrent sessions for requester (limit {limit})")]
    TooManyForRequester { limit: usize },

    #[error("requested duration {requested_ms}ms exceeds policy maximum {max_ms}ms")]
    DurationExceedsPolicy { requested_ms: u64, max_ms: u64 },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

/// Errors surfaced by the session controller's public operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("admission rejected: {0}")]
    AdmissionRejected(Rejection),

    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("engine stop failed: {0}")]
    EngineStopFailed(String),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session {id} is {state}")]
    InvalidState { id: SessionId, state: SessionState },

    #[error("session {id}: cannot move {expected} -> {target}, session is {actual}")]
    InvalidTransition {
        id: SessionId,
        expected: SessionState,
        target: SessionState,
        actual: SessionState,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("duplicate session id: {0}")]
    DuplicateId(SessionId),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ControlError {
    /// Stable machine-readable code for the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Unauthorized(_) => "unauthorized",
            ControlError::AdmissionRejected(_) => "admission_rejected",
            ControlError::EngineUnavailable(_) => "engine_unavailable",
            ControlError::EngineStopFailed(_) => "engine_stop_failed",
            ControlError::NotFound(_) => "not_found",
            ControlError::InvalidState { .. } => "invalid_state",
            ControlError::InvalidTransition { .. } => "invalid_transition",
            ControlError::InvalidConfig(_) => "invalid_config",
            ControlError::DuplicateId(_) => "duplicate_id",
            ControlError::Storage(_) => "storage",
        }
    }

    /// A lost race against another stop or the sweep. Callers may treat it as a no-op.
    pub fn is_benign(&self) -> bool {
        matches!(self, ControlError::InvalidTransition { .. })
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Errors reported by a profiling engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("unknown engine handle {0}")]
    UnknownHandle(u64),

    #[error("recording failed: {0}")]
    Failed(String),
}

/// Errors reported by an artifact store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid artifact name: {0}")]
    InvalidName(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

//! Control surface messages.
//!
//! One JSON object per line in each direction. Requests carry a bearer
//! token next to the operation; responses carry an HTTP-style status.

use crate::engine::CustomEvent;
use crate::error::ControlError;
use crate::registry::SessionFilter;
use crate::session::{RecordingConfig, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Requests ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub token: String,
    pub request: ControlRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Start { config: RecordingConfig },
    Stop { session_id: SessionId },
    Get { session_id: SessionId },
    List {
        #[serde(default)]
        filter: SessionFilter,
    },
    Fetch { session_id: SessionId },
    Emit { event: CustomEvent },
}

impl ControlRequest {
    /// Wire name of the operation, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            ControlRequest::Start { .. } => "start",
            ControlRequest::Stop { .. } => "stop",
            ControlRequest::Get { .. } => "get",
            ControlRequest::List { .. } => "list",
            ControlRequest::Fetch { .. } => "fetch",
            ControlRequest::Emit { .. } => "emit",
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ControlResponse {
    /// `200` carrying `body`.
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
            error: None,
        }
    }

    /// Error response with an explicit status and code.
    pub fn error(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Error response for a controller failure; status from [`status_for`].
    pub fn from_error(err: &ControlError) -> Self {
        Self::error(status_for(err), err.code(), err.to_string())
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Status code a control error maps to.
pub fn status_for(err: &ControlError) -> u16 {
    match err {
        ControlError::Unauthorized(_) => 403,
        ControlError::NotFound(_) => 404,
        ControlError::InvalidState { .. }
        | ControlError::InvalidTransition { .. }
        | ControlError::DuplicateId(_) => 409,
        ControlError::InvalidConfig(_) => 422,
        ControlError::AdmissionRejected(_) => 429,
        ControlError::EngineUnavailable(_) => 503,
        ControlError::EngineStopFailed(_) | ControlError::Storage(_) => 500,
    }
}

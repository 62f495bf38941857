//! Session data model.
//!
//! A [`Session`] is owned by the registry for its whole life and only mutated
//! through [`SessionRegistry::transition`](crate::registry::SessionRegistry::transition).
//! Callers observe it through [`SessionSummary`] snapshots.

use crate::engine::EngineHandle;
use crate::governor::Permit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Opaque session identifier (32 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random session ID (16 random bytes, hex-encoded).
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Requester identity as established by the access layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Identity for the named principal.
    pub fn new(principal: impl Into<String>) -> Self {
        Self(principal.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Lifecycle state of a session.
///
/// Edges: `Pending -> Running -> Stopping -> {Completed | Failed}`,
/// `Running -> Expired`, `Pending -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Stopping,
    Completed,
    Failed,
    Expired,
}

impl SessionState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Expired
        )
    }

    /// Whether a session in this state holds a concurrency slot.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Stopping)
                | (Running, Expired)
                | (Stopping, Completed)
                | (Stopping, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why a session left the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Stopped by its owner or an admin.
    Requested,
    /// Its maximum duration elapsed.
    Timeout,
    /// Drained during process shutdown.
    Shutdown,
    /// The engine refused to begin.
    EngineFailure,
    /// Found unfinished when restoring a registry snapshot.
    Interrupted,
}

/// Recording configuration supplied by a requester.
///
/// `preset` must name an operator-defined preset; requests never carry
/// engine settings directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub preset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    /// Short label folded into the artifact name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl RecordingConfig {
    /// Config for `preset` with default duration and no labels.
    pub fn new(preset: impl Into<String>) -> Self {
        Self {
            preset: preset.into(),
            ..Default::default()
        }
    }

    /// Stop the recording after `duration`.
    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Label folded into the artifact name.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Add a free-form `key=value` label.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Requested duration, if any.
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }
}

/// Reference to a stored recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub location: String,
    pub size: u64,
}

/// A single recording session.
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) owner: Identity,
    pub(crate) state: SessionState,
    pub(crate) config: RecordingConfig,
    /// Effective duration bound (requested or policy default).
    pub(crate) duration: Duration,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) end_reason: Option<EndReason>,
    pub(crate) error: Option<String>,
    pub(crate) artifact: Option<ArtifactRef>,
    /// Present only while running or stopping.
    pub(crate) handle: Option<EngineHandle>,
    /// Concurrency slot, released on the terminal transition.
    pub(crate) permit: Option<Permit>,
}

impl Session {
    /// Create a pending session holding an admission permit.
    pub fn pending(id: SessionId, owner: Identity, config: RecordingConfig, permit: Permit) -> Self {
        Self {
            id,
            owner,
            state: SessionState::Pending,
            config,
            duration: permit.duration(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            end_reason: None,
            error: None,
            artifact: None,
            handle: None,
            permit: Some(permit),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the sweep should stop this session.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let duration = chrono::Duration::from_std(self.duration).ok()?;
        self.started_at.map(|t| t + duration)
    }

    /// Caller-visible copy of this session.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            owner: self.owner.clone(),
            state: self.state,
            config: self.config.clone(),
            duration_ms: self.duration.as_millis() as u64,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            end_reason: self.end_reason,
            error: self.error.clone(),
            artifact: self.artifact.clone(),
        }
    }

    /// Rebuild a session from a persisted summary. Never carries a handle or permit.
    pub(crate) fn from_summary(summary: SessionSummary) -> Self {
        Self {
            id: summary.id,
            owner: summary.owner,
            state: summary.state,
            config: summary.config,
            duration: Duration::from_millis(summary.duration_ms),
            created_at: summary.created_at,
            started_at: summary.started_at,
            ended_at: summary.ended_at,
            end_reason: summary.end_reason,
            error: summary.error,
            artifact: summary.artifact,
            handle: None,
            permit: None,
        }
    }
}

/// Caller-visible view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub owner: Identity,
    pub state: SessionState,
    pub config: RecordingConfig,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
}

/// Wall-clock timestamp that never precedes `after`.
pub(crate) fn stamp_after(after: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match after {
        Some(prev) if prev > now => prev,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use SessionState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Expired));
        assert!(Stopping.can_transition_to(Completed));
        assert!(Stopping.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Running.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Stopping));
        assert!(!Expired.can_transition_to(Stopping));
    }

    #[test]
    fn terminal_states_hold_no_slot() {
        for state in [SessionState::Completed, SessionState::Failed, SessionState::Expired] {
            assert!(state.is_terminal());
            assert!(!state.is_active());
        }
        assert!(SessionState::Stopping.is_active());
    }

    #[test]
    fn generated_ids_are_hex_and_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn config_wire_shape() {
        let config = RecordingConfig::new("default").with_max_duration(Duration::from_secs(60));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["preset"], "default");
        assert_eq!(json["max_duration_ms"], 60_000);
        assert!(json.get("labels").is_none());

        let parsed: RecordingConfig = serde_json::from_str(r#"{"preset":"cpu"}"#).unwrap();
        assert_eq!(parsed.max_duration(), None);
    }

    #[test]
    fn stamp_never_goes_backwards() {
        let future = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(stamp_after(Some(future)), future);
        assert!(stamp_after(None) <= Utc::now());
    }
}

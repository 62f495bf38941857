//! Authoritative catalog of sessions.
//!
//! The map lock is held only long enough to find or insert an entry; each
//! session has its own lock, so transitions on unrelated sessions never
//! contend. [`SessionRegistry::transition`] is the only mutation path.

use crate::error::{ControlError, ControlResult};
use crate::session::{
    stamp_after, EndReason, Identity, Session, SessionId, SessionState, SessionSummary,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Selection criteria for [`SessionRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Identity>,
    /// Only pending, running or stopping sessions.
    #[serde(default)]
    pub active_only: bool,
}

impl SessionFilter {
    /// Whether `summary` passes every criterion that is set.
    pub fn matches(&self, summary: &SessionSummary) -> bool {
        self.state.map_or(true, |s| s == summary.state)
            && self.owner.as_ref().map_or(true, |o| *o == summary.owner)
            && (!self.active_only || summary.state.is_active())
    }
}

/// Serialisable copy of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub sessions: Vec<SessionSummary>,
}

type Entry = Arc<Mutex<Session>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Entry>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created session.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::DuplicateId`] if a session with the same ID is
    /// already registered; the registry is left unchanged.
    pub async fn insert(&self, session: Session) -> ControlResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(ControlError::DuplicateId(session.id().clone()));
        }
        let id = session.id().clone();
        debug!(session_id = %id, owner = %session.owner(), "session registered");
        sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(())
    }

    async fn entry(&self, id: &SessionId) -> ControlResult<Entry> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.clone()))
    }

    async fn entries(&self) -> Vec<Entry> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Caller-visible summary of session `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown or purged sessions.
    pub async fn get(&self, id: &SessionId) -> ControlResult<SessionSummary> {
        let entry = self.entry(id).await?;
        let session = entry.lock().await;
        Ok(session.summary())
    }

    /// Run a read-only closure against a session.
    pub async fn inspect<F, R>(&self, id: &SessionId, f: F) -> ControlResult<R>
    where
        F: FnOnce(&Session) -> R,
    {
        let entry = self.entry(id).await?;
        let session = entry.lock().await;
        Ok(f(&*session))
    }

    /// Identity that started session `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown or purged sessions.
    pub async fn owner_of(&self, id: &SessionId) -> ControlResult<Identity> {
        self.inspect(id, |s| s.owner().clone()).await
    }

    /// Move a session from `from` to `to`, applying `mutate` under the
    /// session's lock.
    ///
    /// Fails with [`ControlError::InvalidTransition`] (without calling
    /// `mutate`) when the session is not in `from` or the edge does not exist.
    /// Entering `Running` stamps `started_at`; entering a terminal state
    /// stamps `ended_at`, releases the concurrency slot and drops any handle
    /// `mutate` left behind.
    pub async fn transition<F, R>(
        &self,
        id: &SessionId,
        from: SessionState,
        to: SessionState,
        mutate: F,
    ) -> ControlResult<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let entry = self.entry(id).await?;
        let mut session = entry.lock().await;

        if session.state != from || !from.can_transition_to(to) {
            return Err(ControlError::InvalidTransition {
                id: id.clone(),
                expected: from,
                target: to,
                actual: session.state,
            });
        }

        let out = mutate(&mut *session);
        session.state = to;

        if to == SessionState::Running {
            session.started_at = Some(stamp_after(Some(session.created_at)));
        }
        if to != SessionState::Completed {
            session.artifact = None;
        }
        if to.is_terminal() {
            session.ended_at = Some(stamp_after(session.started_at.or(Some(session.created_at))));
            if let Some(handle) = session.handle.take() {
                warn!(session_id = %id, handle = handle.raw(), "engine handle released without end");
            }
            drop(session.permit.take());
        }
        debug_assert_eq!(
            session.artifact.is_some(),
            to == SessionState::Completed,
            "artifact must be present exactly when completed"
        );

        info!(session_id = %id, from = %from, to = %to, "session transition");
        Ok(out)
    }

    /// Summaries matching `filter`, oldest first.
    pub async fn list(&self, filter: &SessionFilter) -> Vec<SessionSummary> {
        let mut out = Vec::new();
        for entry in self.entries().await {
            let summary = entry.lock().await.summary();
            if filter.matches(&summary) {
                out.push(summary);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Running sessions whose deadline is at or before `now`.
    pub async fn running_past_deadline(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut due = Vec::new();
        for entry in self.entries().await {
            let session = entry.lock().await;
            if session.state == SessionState::Running
                && session.deadline().is_some_and(|d| d <= now)
            {
                due.push(session.id.clone());
            }
        }
        due
    }

    /// IDs of every session currently in `state`.
    pub async fn ids_in_state(&self, state: SessionState) -> Vec<SessionId> {
        let mut ids = Vec::new();
        for entry in self.entries().await {
            let session = entry.lock().await;
            if session.state == state {
                ids.push(session.id.clone());
            }
        }
        ids
    }

    /// Remove terminal sessions that ended more than `retention` ago.
    pub async fn purge_older_than(&self, retention: Duration) -> Vec<SessionId> {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - retention;

        let mut sessions = self.sessions.write().await;
        let mut purged = Vec::new();
        sessions.retain(|id, entry| {
            // A locked session is mid-transition or being read; leave it for the next pass.
            let Ok(session) = entry.try_lock() else {
                return true;
            };
            let expired = session.state.is_terminal() && session.ended_at.is_some_and(|t| t < cutoff);
            if expired {
                purged.push(id.clone());
            }
            !expired
        });

        if !purged.is_empty() {
            debug!(count = purged.len(), "purged retained sessions");
        }
        purged
    }

    /// Sessions holding a concurrency slot.
    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for entry in self.entries().await {
            if entry.lock().await.state.is_active() {
                count += 1;
            }
        }
        count
    }

    /// Number of non-terminal sessions owned by `owner`.
    pub async fn active_for(&self, owner: &Identity) -> usize {
        let mut count = 0;
        for entry in self.entries().await {
            let session = entry.lock().await;
            if session.state.is_active() && session.owner == *owner {
                count += 1;
            }
        }
        count
    }

    /// Number of sessions held, terminal ones included.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry holds no sessions at all.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Point-in-time copy of every session, suitable for persisting.
    ///
    /// Engine handles and concurrency slots are not part of the snapshot.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            taken_at: Utc::now(),
            sessions: self.list(&SessionFilter::default()).await,
        }
    }

    /// Load a snapshot taken by a previous process.
    ///
    /// Engine handles do not survive a restart, so unfinished sessions are
    /// closed out: running becomes expired, pending and stopping become
    /// failed. Every restored session is terminal and holds no slot.
    /// Returns the number of sessions restored; IDs already present are skipped.
    pub async fn restore(&self, snapshot: RegistrySnapshot) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut restored = 0;
        for mut summary in snapshot.sessions {
            if sessions.contains_key(&summary.id) {
                continue;
            }
            let closed = match summary.state {
                SessionState::Running => Some(SessionState::Expired),
                SessionState::Pending | SessionState::Stopping => Some(SessionState::Failed),
                _ => None,
            };
            if let Some(state) = closed {
                warn!(session_id = %summary.id, was = %summary.state, now = %state, "closing interrupted session");
                summary.state = state;
                summary.end_reason = Some(EndReason::Interrupted);
                summary.ended_at = Some(stamp_after(summary.started_at.or(Some(summary.created_at))));
                summary.error = Some("interrupted by restart".to_string());
                summary.artifact = None;
            }
            if summary.state != SessionState::Completed {
                summary.artifact = None;
            }
            sessions.insert(
                summary.id.clone(),
                Arc::new(Mutex::new(Session::from_summary(summary))),
            );
            restored += 1;
        }
        info!(restored, "registry restored from snapshot");
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineHandle;
    use crate::governor::{GovernorPolicy, ResourceGovernor};
    use crate::session::{ArtifactRef, RecordingConfig};

    fn governor(max: usize) -> ResourceGovernor {
        ResourceGovernor::new(GovernorPolicy {
            max_concurrent_sessions: max,
            max_concurrent_per_requester: max,
            min_interval_between_starts: Duration::ZERO,
            starts_per_window: 0,
            ..GovernorPolicy::default()
        })
    }

    async fn pending(registry: &SessionRegistry, governor: &ResourceGovernor, owner: &str) -> SessionId {
        let owner = Identity::new(owner);
        let permit = governor
            .admit(&owner, &RecordingConfig::new("default"), None)
            .unwrap();
        let id = SessionId::generate();
        registry
            .insert(Session::pending(id.clone(), owner, RecordingConfig::new("default"), permit))
            .await
            .unwrap();
        id
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef {
            name: "n".into(),
            location: "mem://n".into(),
            size: 1,
        }
    }

    #[tokio::test]
    async fn full_lifecycle_stamps_and_releases() {
        let gov = governor(1);
        let registry = SessionRegistry::new();
        let id = pending(&registry, &gov, "alice").await;
        assert_eq!(gov.in_flight(), 1);

        registry
            .transition(&id, SessionState::Pending, SessionState::Running, |s| {
                s.handle = Some(EngineHandle::new(1));
            })
            .await
            .unwrap();
        let handle = registry
            .transition(&id, SessionState::Running, SessionState::Stopping, |s| s.handle.take())
            .await
            .unwrap();
        assert!(handle.is_some());
        assert_eq!(gov.in_flight(), 1);

        registry
            .transition(&id, SessionState::Stopping, SessionState::Completed, |s| {
                s.artifact = Some(artifact());
            })
            .await
            .unwrap();
        assert_eq!(gov.in_flight(), 0);

        let s = registry.get(&id).await.unwrap();
        assert_eq!(s.state, SessionState::Completed);
        assert!(s.artifact.is_some());
        let (created, started, ended) = (s.created_at, s.started_at.unwrap(), s.ended_at.unwrap());
        assert!(created <= started && started <= ended);
    }

    #[tokio::test]
    async fn wrong_from_state_is_rejected_without_mutation() {
        let gov = governor(1);
        let registry = SessionRegistry::new();
        let id = pending(&registry, &gov, "alice").await;

        let mut called = false;
        let err = registry
            .transition(&id, SessionState::Running, SessionState::Stopping, |_| called = true)
            .await
            .unwrap_err();
        assert!(err.is_benign());
        assert!(!called);
        assert_eq!(registry.get(&id).await.unwrap().state, SessionState::Pending);
    }

    #[tokio::test]
    async fn non_edges_are_rejected() {
        let gov = governor(1);
        let registry = SessionRegistry::new();
        let id = pending(&registry, &gov, "alice").await;
        assert!(registry
            .transition(&id, SessionState::Pending, SessionState::Completed, |_| ())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn concurrent_transitions_have_one_winner() {
        let gov = governor(1);
        let registry = Arc::new(SessionRegistry::new());
        let id = pending(&registry, &gov, "alice").await;
        registry
            .transition(&id, SessionState::Pending, SessionState::Running, |_| ())
            .await
            .unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move {
                    registry
                        .transition(&id, SessionState::Running, SessionState::Stopping, |_| ())
                        .await
                })
            })
            .collect();
        let mut wins = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn failure_releases_slot_and_keeps_record() {
        let gov = governor(1);
        let registry = SessionRegistry::new();
        let id = pending(&registry, &gov, "alice").await;
        registry
            .transition(&id, SessionState::Pending, SessionState::Failed, |s| {
                s.error = Some("boom".into());
            })
            .await
            .unwrap();
        assert_eq!(gov.in_flight(), 0);
        let s = registry.get(&id).await.unwrap();
        assert_eq!(s.state, SessionState::Failed);
        assert_eq!(s.error.as_deref(), Some("boom"));
        assert!(s.artifact.is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_rejected() {
        let gov = governor(2);
        let registry = SessionRegistry::new();
        let id = pending(&registry, &gov, "alice").await;
        let permit = gov
            .admit(&Identity::new("bob"), &RecordingConfig::new("default"), None)
            .unwrap();
        let dup = Session::pending(id.clone(), Identity::new("bob"), RecordingConfig::new("default"), permit);
        assert!(matches!(registry.insert(dup).await, Err(ControlError::DuplicateId(_))));
        // the rejected session's permit was dropped with it
        assert_eq!(gov.in_flight(), 1);
    }

    #[tokio::test]
    async fn list_filters() {
        let gov = governor(4);
        let registry = SessionRegistry::new();
        let a = pending(&registry, &gov, "alice").await;
        let _b = pending(&registry, &gov, "bob").await;
        registry
            .transition(&a, SessionState::Pending, SessionState::Running, |_| ())
            .await
            .unwrap();

        let running = registry
            .list(&SessionFilter {
                state: Some(SessionState::Running),
                ..Default::default()
            })
            .await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a);

        let bobs = registry
            .list(&SessionFilter {
                owner: Some(Identity::new("bob")),
                ..Default::default()
            })
            .await;
        assert_eq!(bobs.len(), 1);
        assert_eq!(registry.active_count().await, 2);
        assert_eq!(registry.active_for(&Identity::new("alice")).await, 1);
    }

    #[tokio::test]
    async fn purge_only_old_terminal_sessions() {
        let gov = governor(2);
        let registry = SessionRegistry::new();
        let done = pending(&registry, &gov, "alice").await;
        let live = pending(&registry, &gov, "alice").await;
        registry
            .transition(&done, SessionState::Pending, SessionState::Failed, |_| ())
            .await
            .unwrap();

        assert!(registry.purge_older_than(Duration::from_secs(3600)).await.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let purged = registry.purge_older_than(Duration::from_millis(1)).await;
        assert_eq!(purged, vec![done.clone()]);
        assert!(matches!(registry.get(&done).await, Err(ControlError::NotFound(_))));
        assert!(registry.get(&live).await.is_ok());
    }

    #[tokio::test]
    async fn restore_closes_unfinished_sessions() {
        let gov = governor(3);
        let old = SessionRegistry::new();
        let running = pending(&old, &gov, "alice").await;
        let stopping = pending(&old, &gov, "alice").await;
        let waiting = pending(&old, &gov, "bob").await;
        old.transition(&running, SessionState::Pending, SessionState::Running, |_| ())
            .await
            .unwrap();
        old.transition(&stopping, SessionState::Pending, SessionState::Running, |_| ())
            .await
            .unwrap();
        old.transition(&stopping, SessionState::Running, SessionState::Stopping, |_| ())
            .await
            .unwrap();

        let json = serde_json::to_string(&old.snapshot().await).unwrap();
        let snapshot: RegistrySnapshot = serde_json::from_str(&json).unwrap();

        let fresh = SessionRegistry::new();
        assert_eq!(fresh.restore(snapshot.clone()).await, 3);
        assert_eq!(fresh.restore(snapshot).await, 0);
        assert_eq!(fresh.active_count().await, 0);

        let r = fresh.get(&running).await.unwrap();
        assert_eq!(r.state, SessionState::Expired);
        assert_eq!(r.end_reason, Some(EndReason::Interrupted));
        assert_eq!(fresh.get(&stopping).await.unwrap().state, SessionState::Failed);
        assert_eq!(fresh.get(&waiting).await.unwrap().state, SessionState::Failed);
    }
}

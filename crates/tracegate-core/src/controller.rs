//! Session controller.
//!
//! Validates requests against the access policy, admits them through the
//! governor, and drives every state transition. It is the only caller of
//! the engine adapter and the only writer of the registry.
//!
//! No registry or session lock is held while the engine works: a session
//! is moved into `Stopping` (taking its handle) before `end` is called, and
//! the result is written back with a second transition.

use crate::access::{AccessPolicy, Action, Decision};
use crate::engine::{
    CustomEvent, EngineAdapter, EngineHandle, EventSink, Preset, PresetCatalog, ProfilingEngine,
    RecordingSpec,
};
use crate::error::{ControlError, ControlResult};
use crate::governor::{GovernorPolicy, ResourceGovernor};
use crate::naming::ArtifactNamer;
use crate::registry::{SessionFilter, SessionRegistry};
use crate::session::{
    ArtifactRef, EndReason, Identity, RecordingConfig, Session, SessionId, SessionState,
    SessionSummary,
};
use crate::storage::ArtifactStore;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MAX_LABELS: usize = 16;
const MAX_LABEL_BYTES: usize = 128;

/// What the sweep does with a session whose duration elapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Stop normally and keep the artifact.
    #[default]
    Collect,
    /// End the recording, drop its output and mark the session expired.
    Discard,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Terminal sessions are purged this long after ending.
    pub retention: Duration,
    pub timeout_action: TimeoutAction,
    /// Capacity of the custom event queue.
    pub event_buffer: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            timeout_action: TimeoutAction::Collect,
            event_buffer: 1024,
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: Vec<SessionId>,
    pub expired: Vec<SessionId>,
    pub failed: Vec<SessionId>,
    pub purged: usize,
}

impl SweepReport {
    /// Whether the sweep touched nothing.
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.expired.is_empty() && self.failed.is_empty() && self.purged == 0
    }
}

pub struct ControllerBuilder {
    engine: Arc<dyn ProfilingEngine>,
    store: Arc<dyn ArtifactStore>,
    access: Arc<dyn AccessPolicy>,
    registry: Option<Arc<SessionRegistry>>,
    policy: GovernorPolicy,
    presets: PresetCatalog,
    namer: ArtifactNamer,
    settings: ControllerSettings,
    begin_timeout: Option<Duration>,
    end_timeout: Option<Duration>,
}

impl ControllerBuilder {
    /// Use an existing registry, e.g. one restored from a snapshot.
    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Admission limits for the governor.
    pub fn policy(mut self, policy: GovernorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Presets start requests may name.
    pub fn presets(mut self, presets: PresetCatalog) -> Self {
        self.presets = presets;
        self
    }

    /// Namer for completed artifacts.
    pub fn namer(mut self, namer: ArtifactNamer) -> Self {
        self.namer = namer;
        self
    }

    /// Retention, timeout action and event buffer size.
    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Bound engine `begin` and `end` calls.
    ///
    /// # Arguments
    ///
    /// * `begin` - Longest wait for a recording to start before the session fails.
    /// * `end` - Longest wait for a recording to finish before the session fails
    ///   and its slot is released.
    pub fn engine_timeouts(mut self, begin: Duration, end: Duration) -> Self {
        self.begin_timeout = Some(begin);
        self.end_timeout = Some(end);
        self
    }

    /// Build the controller. Must run inside a tokio runtime (it spawns the
    /// event forwarder).
    pub fn build(self) -> SessionController {
        let mut engine = EngineAdapter::new(Arc::clone(&self.engine));
        if let (Some(begin), Some(end)) = (self.begin_timeout, self.end_timeout) {
            engine = engine.with_timeouts(begin, end);
        }
        let (events, _forwarder) = EventSink::spawn(self.engine, self.settings.event_buffer);
        SessionController {
            registry: self.registry.unwrap_or_default(),
            governor: ResourceGovernor::new(self.policy),
            engine,
            events,
            namer: self.namer,
            store: self.store,
            access: self.access,
            presets: self.presets,
            settings: self.settings,
        }
    }
}

pub struct SessionController {
    registry: Arc<SessionRegistry>,
    governor: ResourceGovernor,
    engine: EngineAdapter,
    events: EventSink,
    namer: ArtifactNamer,
    store: Arc<dyn ArtifactStore>,
    access: Arc<dyn AccessPolicy>,
    presets: PresetCatalog,
    settings: ControllerSettings,
}

impl SessionController {
    /// Start building a controller over `engine`, `store` and `access`.
    ///
    /// Everything else has defaults; see [`ControllerBuilder`].
    pub fn builder(
        engine: Arc<dyn ProfilingEngine>,
        store: Arc<dyn ArtifactStore>,
        access: Arc<dyn AccessPolicy>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            engine,
            store,
            access,
            registry: None,
            policy: GovernorPolicy::default(),
            presets: PresetCatalog::default(),
            namer: ArtifactNamer::new("localhost"),
            settings: ControllerSettings::default(),
            begin_timeout: None,
            end_timeout: None,
        }
    }

    /// The registry holding every session.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The governor tracking admitted sessions.
    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    /// Handle for instrumented code to emit custom events.
    pub fn events(&self) -> EventSink {
        self.events.clone()
    }

    fn authorize(&self, identity: &Identity, action: Action, owner: Option<&Identity>) -> ControlResult<()> {
        match self.access.authorize(identity, action, owner) {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                warn!(requester = %identity, ?action, "access denied");
                Err(ControlError::Unauthorized(format!(
                    "{identity} may not {action:?}"
                )))
            }
        }
    }

    fn validate(&self, config: &RecordingConfig) -> ControlResult<Preset> {
        let preset = self.presets.resolve(&config.preset)?.clone();
        if config.labels.len() > MAX_LABELS {
            return Err(ControlError::InvalidConfig(format!(
                "at most {MAX_LABELS} labels allowed"
            )));
        }
        let oversized = config
            .labels
            .iter()
            .chain(config.label.as_ref().map(|l| (l, l)))
            .any(|(k, v)| k.is_empty() || k.len() > MAX_LABEL_BYTES || v.len() > MAX_LABEL_BYTES);
        if oversized {
            return Err(ControlError::InvalidConfig(format!(
                "labels must be 1..={MAX_LABEL_BYTES} bytes"
            )));
        }
        if config.max_duration_ms == Some(0) {
            return Err(ControlError::InvalidConfig("max_duration_ms must be positive".into()));
        }
        Ok(preset)
    }

    /// Start a recording session for `requester`.
    ///
    /// Validation and admission failures leave the registry untouched. Once
    /// the session is registered, an engine failure marks it `Failed`.
    pub async fn start_session(
        &self,
        requester: &Identity,
        config: RecordingConfig,
    ) -> ControlResult<SessionId> {
        self.authorize(requester, Action::Start, None)?;
        let preset = self.validate(&config)?;

        let permit = self
            .governor
            .admit(requester, &config, self.access.session_cap(requester))
            .map_err(|rejection| {
                warn!(requester = %requester, %rejection, "admission rejected");
                ControlError::AdmissionRejected(rejection)
            })?;

        let id = SessionId::generate();
        let spec = RecordingSpec {
            session_id: id.clone(),
            preset,
            labels: config.labels.clone(),
        };
        self.registry
            .insert(Session::pending(id.clone(), requester.clone(), config, permit))
            .await?;

        match self.engine.begin(spec).await {
            Ok(handle) => {
                let mut slot = Some(handle);
                let started = self
                    .registry
                    .transition(&id, SessionState::Pending, SessionState::Running, |s| {
                        s.handle = slot.take();
                    })
                    .await;
                if let Err(e) = started {
                    if let Some(handle) = slot {
                        self.release_handle(&id, handle).await;
                    }
                    return Err(e);
                }
                info!(session_id = %id, requester = %requester, "session started");
                Ok(id)
            }
            Err(e) => {
                let message = e.to_string();
                let failed = self
                    .registry
                    .transition(&id, SessionState::Pending, SessionState::Failed, |s| {
                        s.error = Some(message);
                        s.end_reason = Some(EndReason::EngineFailure);
                    })
                    .await;
                if let Err(te) = failed {
                    warn!(session_id = %id, error = %te, "could not record begin failure");
                }
                warn!(session_id = %id, error = %e, "engine refused to begin");
                Err(e)
            }
        }
    }

    /// Stop a running session and return its artifact.
    ///
    /// A stop that loses a race against another stop or the sweep gets
    /// [`ControlError::InvalidTransition`] and never reaches the engine. A
    /// session still starting up is [`ControlError::InvalidState`].
    pub async fn stop_session(&self, requester: &Identity, id: &SessionId) -> ControlResult<ArtifactRef> {
        self.check_access(requester, Action::Stop, id).await?;
        match self.finish(id, EndReason::Requested).await {
            Err(ControlError::InvalidTransition {
                actual: SessionState::Pending,
                ..
            }) => Err(ControlError::InvalidState {
                id: id.clone(),
                state: SessionState::Pending,
            }),
            outcome => outcome,
        }
    }

    /// Summary of one session, if `requester` may view it.
    pub async fn describe_session(&self, requester: &Identity, id: &SessionId) -> ControlResult<SessionSummary> {
        self.check_access(requester, Action::View, id).await?;
        self.registry.get(id).await
    }

    /// Check that `requester` may perform `action` on session `id`.
    ///
    /// Sessions that are off limits only because someone else owns them are
    /// reported as [`ControlError::NotFound`], the same as missing ones.
    async fn check_access(&self, requester: &Identity, action: Action, id: &SessionId) -> ControlResult<()> {
        self.authorize(requester, action, None)?;
        let owner = self.registry.owner_of(id).await?;
        if self.access.authorize(requester, action, Some(&owner)) == Decision::Deny {
            debug!(requester = %requester, session_id = %id, ?action, "session belongs to another principal");
            return Err(ControlError::NotFound(id.clone()));
        }
        Ok(())
    }

    /// Sessions matching `filter` that `requester` may see.
    pub async fn list_sessions(&self, requester: &Identity, filter: &SessionFilter) -> ControlResult<Vec<SessionSummary>> {
        self.authorize(requester, Action::View, None)?;
        let visible = self
            .registry
            .list(filter)
            .await
            .into_iter()
            .filter(|s| self.access.authorize(requester, Action::View, Some(&s.owner)) == Decision::Allow)
            .collect();
        Ok(visible)
    }

    /// Bytes of a completed session's artifact.
    pub async fn fetch_artifact(&self, requester: &Identity, id: &SessionId) -> ControlResult<Vec<u8>> {
        let summary = self.describe_session(requester, id).await?;
        let Some(artifact) = summary.artifact else {
            return Err(ControlError::InvalidState {
                id: id.clone(),
                state: summary.state,
            });
        };
        Ok(self.store.fetch(&artifact.location).await?)
    }

    /// Queue a custom event on behalf of `requester`.
    pub fn emit(&self, requester: &Identity, event: CustomEvent) -> ControlResult<bool> {
        self.authorize(requester, Action::Emit, None)?;
        Ok(self.events.emit(event))
    }

    /// Drive `Running -> Stopping -> {Completed | Failed}`.
    async fn finish(&self, id: &SessionId, reason: EndReason) -> ControlResult<ArtifactRef> {
        let handle = self
            .registry
            .transition(id, SessionState::Running, SessionState::Stopping, |s| {
                s.end_reason = Some(reason);
                s.handle.take()
            })
            .await?;

        let Some(handle) = handle else {
            let err = ControlError::EngineStopFailed("session had no engine handle".into());
            self.fail(id, &err).await;
            return Err(err);
        };

        let bytes = match self.engine.end(handle).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(id, &e).await;
                return Err(e);
            }
        };

        let name = self.registry.inspect(id, |s| self.namer.name(s)).await?;
        let location = match self.store.store(&name, &bytes).await {
            Ok(location) => location,
            Err(e) => {
                let err = ControlError::Storage(e);
                self.fail(id, &err).await;
                return Err(err);
            }
        };

        let artifact = ArtifactRef {
            name,
            location,
            size: bytes.len() as u64,
        };
        let attached = artifact.clone();
        self.registry
            .transition(id, SessionState::Stopping, SessionState::Completed, move |s| {
                s.artifact = Some(attached);
            })
            .await?;
        info!(session_id = %id, ?reason, artifact = %artifact.name, size = artifact.size, "session completed");
        Ok(artifact)
    }

    async fn fail(&self, id: &SessionId, err: &ControlError) {
        let message = err.to_string();
        warn!(session_id = %id, error = %message, "session failed");
        if let Err(e) = self
            .registry
            .transition(id, SessionState::Stopping, SessionState::Failed, |s| {
                s.error = Some(message);
            })
            .await
        {
            warn!(session_id = %id, error = %e, "could not record failure");
        }
    }

    /// `Running -> Expired`, ending the recording and discarding its output.
    async fn expire(&self, id: &SessionId) -> ControlResult<()> {
        let handle = self
            .registry
            .transition(id, SessionState::Running, SessionState::Expired, |s| {
                s.end_reason = Some(EndReason::Timeout);
                s.handle.take()
            })
            .await?;
        if let Some(handle) = handle {
            if let Err(e) = self.engine.end(handle).await {
                warn!(session_id = %id, error = %e, "engine end failed for expired session");
            }
        }
        info!(session_id = %id, "session expired");
        Ok(())
    }

    async fn release_handle(&self, id: &SessionId, handle: EngineHandle) {
        if let Err(e) = self.engine.end(handle).await {
            warn!(session_id = %id, error = %e, "could not release orphaned engine handle");
        }
    }

    /// One sweep pass at `now`: stop overdue sessions, purge old ones.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let overdue = self.registry.running_past_deadline(now).await;
        let mut report = SweepReport::default();

        let outcomes = join_all(overdue.iter().map(|id| async move {
            let outcome = match self.settings.timeout_action {
                TimeoutAction::Collect => self.finish(id, EndReason::Timeout).await.map(|_| SessionState::Completed),
                TimeoutAction::Discard => self.expire(id).await.map(|_| SessionState::Expired),
            };
            (id.clone(), outcome)
        }))
        .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(SessionState::Expired) => report.expired.push(id),
                Ok(_) => report.completed.push(id),
                Err(e) if e.is_benign() => debug!(session_id = %id, "sweep lost race to a stop"),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "timed-out session failed to stop");
                    report.failed.push(id);
                }
            }
        }

        report.purged = self.registry.purge_older_than(self.settings.retention).await.len();
        self.governor.gc();
        report
    }

    /// Run the sweep every `interval` until `shutdown` flips to `true`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = controller.sweep_once(Utc::now()).await;
                        if !report.is_empty() {
                            debug!(
                                completed = report.completed.len(),
                                expired = report.expired.len(),
                                failed = report.failed.len(),
                                purged = report.purged,
                                "sweep"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }

    /// Stop every running session. Returns the IDs that completed.
    pub async fn shutdown(&self) -> Vec<SessionId> {
        let running = self.registry.ids_in_state(SessionState::Running).await;
        if !running.is_empty() {
            info!(count = running.len(), "draining running sessions");
        }
        let outcomes = join_all(running.iter().map(|id| self.finish(id, EndReason::Shutdown))).await;
        running
            .into_iter()
            .zip(outcomes)
            .filter_map(|(id, outcome)| outcome.ok().map(|_| id))
            .collect()
    }
}

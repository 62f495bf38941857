//! Profiling engine boundary.
//!
//! The engine is an opaque capability with two blocking calls (`begin`,
//! `end`) and a fire-and-forget `emit`. [`EngineAdapter`] runs the blocking
//! calls on the blocking pool with a time bound and maps failures into the
//! controller's error taxonomy.

pub mod capture;
pub mod events;

pub use capture::{parse_capture, CaptureEngine, CaptureLine};
pub use events::{CustomEvent, EventSink};

use crate::error::{ControlError, ControlResult, EngineError};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

const DEFAULT_BEGIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_END_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque token for an in-progress recording.
///
/// Not `Clone`: ending a recording consumes the handle, so one handle can
/// only ever be ended once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EngineHandle(u64);

impl EngineHandle {
    /// Wrap an engine-assigned handle value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The engine-assigned value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Operator-defined recording preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    /// Event categories to capture. Empty captures everything.
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_max_events() -> usize {
    100_000
}

impl Preset {
    /// Preset capturing every category.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            categories: Vec::new(),
            max_events: default_max_events(),
        }
    }

    /// Only capture events in `categories`.
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// Whether events in `category` are recorded under this preset.
    pub fn captures(&self, category: &str) -> bool {
        self.categories.is_empty() || self.categories.iter().any(|c| c == category)
    }
}

/// The set of presets a requester may choose from.
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    presets: HashMap<String, Preset>,
}

impl PresetCatalog {
    /// Build a catalog. A capture-everything `default` preset is added when missing.
    pub fn new(presets: impl IntoIterator<Item = Preset>) -> Self {
        let mut presets: HashMap<String, Preset> =
            presets.into_iter().map(|p| (p.name.clone(), p)).collect();
        presets
            .entry("default".to_string())
            .or_insert_with(|| Preset::new("default"));
        Self { presets }
    }

    /// Look up a preset by name.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidConfig`] when no preset is called `name`.
    pub fn resolve(&self, name: &str) -> ControlResult<&Preset> {
        self.presets
            .get(name)
            .ok_or_else(|| ControlError::InvalidConfig(format!("unknown preset: {name}")))
    }

    /// Names of all presets, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.presets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for PresetCatalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Everything an engine needs to begin one recording.
#[derive(Debug, Clone)]
pub struct RecordingSpec {
    pub session_id: SessionId,
    pub preset: Preset,
    pub labels: BTreeMap<String, String>,
}

/// The external profiling capability.
///
/// `begin` and `end` may block. `end` is not idempotent, which the handle's
/// move semantics enforce. `emit` must not block.
pub trait ProfilingEngine: Send + Sync + 'static {
    fn begin(&self, spec: &RecordingSpec) -> Result<EngineHandle, EngineError>;

    fn end(&self, handle: EngineHandle) -> Result<Vec<u8>, EngineError>;

    fn emit(&self, event: CustomEvent);
}

/// Facade over a [`ProfilingEngine`] used by the controller.
#[derive(Clone)]
pub struct EngineAdapter {
    engine: Arc<dyn ProfilingEngine>,
    begin_timeout: Duration,
    end_timeout: Duration,
}

impl EngineAdapter {
    /// Wrap `engine` with the default timeouts.
    pub fn new(engine: Arc<dyn ProfilingEngine>) -> Self {
        Self {
            engine,
            begin_timeout: DEFAULT_BEGIN_TIMEOUT,
            end_timeout: DEFAULT_END_TIMEOUT,
        }
    }

    /// Override the `begin` and `end` timeouts.
    pub fn with_timeouts(mut self, begin: Duration, end: Duration) -> Self {
        self.begin_timeout = begin;
        self.end_timeout = end;
        self
    }

    /// The wrapped engine.
    pub fn engine(&self) -> Arc<dyn ProfilingEngine> {
        Arc::clone(&self.engine)
    }

    /// Begin a recording.
    ///
    /// If `begin` outlives the timeout, a late handle is ended in the
    /// background so the engine does not keep recording for nobody.
    pub async fn begin(&self, spec: RecordingSpec) -> ControlResult<EngineHandle> {
        let engine = Arc::clone(&self.engine);
        let mut task = tokio::task::spawn_blocking(move || engine.begin(&spec));

        match timeout(self.begin_timeout, &mut task).await {
            Ok(Ok(Ok(handle))) => Ok(handle),
            Ok(Ok(Err(e))) => Err(ControlError::EngineUnavailable(e.to_string())),
            Ok(Err(join)) => Err(ControlError::EngineUnavailable(format!(
                "engine begin panicked: {join}"
            ))),
            Err(_) => {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    if let Ok(Ok(handle)) = task.await {
                        let raw = handle.raw();
                        let ended = tokio::task::spawn_blocking(move || engine.end(handle)).await;
                        warn!(handle = raw, ok = matches!(ended, Ok(Ok(_))), "ended late engine handle");
                    }
                });
                Err(ControlError::EngineUnavailable(format!(
                    "engine begin timed out after {}ms",
                    self.begin_timeout.as_millis()
                )))
            }
        }
    }

    /// End a recording. The handle is consumed whatever the outcome.
    pub async fn end(&self, handle: EngineHandle) -> ControlResult<Vec<u8>> {
        let engine = Arc::clone(&self.engine);
        let task = tokio::task::spawn_blocking(move || engine.end(handle));

        match timeout(self.end_timeout, task).await {
            Ok(Ok(Ok(bytes))) => Ok(bytes),
            Ok(Ok(Err(e))) => Err(ControlError::EngineStopFailed(e.to_string())),
            Ok(Err(join)) => Err(ControlError::EngineStopFailed(format!(
                "engine end panicked: {join}"
            ))),
            Err(_) => Err(ControlError::EngineStopFailed(format!(
                "engine end timed out after {}ms",
                self.end_timeout.as_millis()
            ))),
        }
    }
}

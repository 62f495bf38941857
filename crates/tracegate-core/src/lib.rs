//! tracegate-core: lifecycle manager for on-demand diagnostic recordings.
//!
//! Provides the session model and state machine, the admission governor,
//! the session registry, the controller that drives engine begin/end, the
//! built-in capture engine, artifact naming and storage, and the control
//! surface message types.

pub mod access;
pub mod controller;
pub mod engine;
pub mod error;
pub mod governor;
pub mod naming;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod storage;

// Re-export commonly used items at crate root.
pub use access::{AccessPolicy, Action, Decision, PrincipalGrant, StaticAccessPolicy};
pub use controller::{ControllerSettings, SessionController, SweepReport, TimeoutAction};
pub use engine::{CaptureEngine, CustomEvent, EngineAdapter, Preset, PresetCatalog, ProfilingEngine};
pub use error::{ControlError, ControlResult, EngineError, Rejection, StorageError};
pub use governor::{GovernorPolicy, ResourceGovernor};
pub use naming::ArtifactNamer;
pub use protocol::{ControlEnvelope, ControlRequest, ControlResponse};
pub use registry::{RegistrySnapshot, SessionFilter, SessionRegistry};
pub use session::{
    ArtifactRef, EndReason, Identity, RecordingConfig, SessionId, SessionState, SessionSummary,
};
pub use storage::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};

//! In-process capture engine.
//!
//! Each recording is an independent buffer of custom events filtered by the
//! preset's categories. Ending a recording serialises it as newline-delimited
//! JSON: a header line, one line per event, and a footer.

use super::{CustomEvent, EngineHandle, ProfilingEngine, RecordingSpec};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, error};

const DEFAULT_MAX_ACTIVE: usize = 64;

/// One line of a capture artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureLine {
    Header {
        session_id: String,
        preset: String,
        categories: Vec<String>,
        labels: BTreeMap<String, String>,
        started_at: DateTime<Utc>,
    },
    Event {
        /// Milliseconds since the recording began.
        timestamp_ms: u64,
        category: String,
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Footer {
        events: u64,
        dropped: u64,
        overflowed: bool,
        duration_ms: u64,
    },
}

struct Recording {
    spec: RecordingSpec,
    started: Instant,
    started_at: DateTime<Utc>,
    lines: Vec<CaptureLine>,
    dropped: u64,
}

impl Recording {
    fn push(&mut self, event: &CustomEvent) {
        if !self.spec.preset.captures(&event.category) {
            return;
        }
        if self.lines.len() >= self.spec.preset.max_events {
            self.dropped += 1;
            return;
        }
        self.lines.push(CaptureLine::Event {
            timestamp_ms: self.started.elapsed().as_millis() as u64,
            category: event.category.clone(),
            name: event.name.clone(),
            payload: event.payload.clone(),
        });
    }

    fn finish(self) -> Result<Vec<u8>, EngineError> {
        let header = CaptureLine::Header {
            session_id: self.spec.session_id.to_string(),
            preset: self.spec.preset.name.clone(),
            categories: self.spec.preset.categories.clone(),
            labels: self.spec.labels.clone(),
            started_at: self.started_at,
        };
        let footer = CaptureLine::Footer {
            events: self.lines.len() as u64,
            dropped: self.dropped,
            overflowed: self.dropped > 0,
            duration_ms: self.started.elapsed().as_millis() as u64,
        };

        let mut out = Vec::new();
        for line in std::iter::once(&header)
            .chain(self.lines.iter())
            .chain(std::iter::once(&footer))
        {
            serde_json::to_writer(&mut out, line)
                .map_err(|e| EngineError::Failed(format!("serialize capture: {e}")))?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[derive(Default)]
struct CaptureState {
    next_handle: u64,
    recordings: HashMap<u64, Recording>,
}

/// In-process [`ProfilingEngine`] that records emitted custom events.
pub struct CaptureEngine {
    state: Mutex<CaptureState>,
    max_active: usize,
}

impl CaptureEngine {
    /// Engine with no limit on concurrent recordings.
    pub fn new() -> Self {
        Self::with_max_active(DEFAULT_MAX_ACTIVE)
    }

    /// Engine-level ceiling on simultaneous recordings; `begin` fails past it.
    pub fn with_max_active(max_active: usize) -> Self {
        Self {
            state: Mutex::new(CaptureState::default()),
            max_active,
        }
    }

    /// Recordings currently open.
    pub fn active(&self) -> usize {
        self.lock().recordings.len()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfilingEngine for CaptureEngine {
    fn begin(&self, spec: &RecordingSpec) -> Result<EngineHandle, EngineError> {
        let mut state = self.lock();
        if state.recordings.len() >= self.max_active {
            return Err(EngineError::Unavailable(format!(
                "capture engine at capacity ({})",
                self.max_active
            )));
        }

        state.next_handle += 1;
        let raw = state.next_handle;
        state.recordings.insert(
            raw,
            Recording {
                spec: spec.clone(),
                started: Instant::now(),
                started_at: Utc::now(),
                lines: Vec::new(),
                dropped: 0,
            },
        );
        debug!(handle = raw, session_id = %spec.session_id, preset = %spec.preset.name, "capture started");
        Ok(EngineHandle::new(raw))
    }

    fn end(&self, handle: EngineHandle) -> Result<Vec<u8>, EngineError> {
        let recording = self
            .lock()
            .recordings
            .remove(&handle.raw())
            .ok_or(EngineError::UnknownHandle(handle.raw()))?;
        debug!(handle = handle.raw(), events = recording.lines.len(), "capture ended");
        recording.finish()
    }

    fn emit(&self, event: CustomEvent) {
        let mut state = self.lock();
        for recording in state.recordings.values_mut() {
            recording.push(&event);
        }
    }
}

/// Parse a capture artifact back into lines, skipping malformed ones.
pub fn parse_capture(bytes: &[u8]) -> Vec<CaptureLine> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CaptureLine>(line) {
            Ok(parsed) => lines.push(parsed),
            Err(e) => error!(error = %e, "skipping malformed capture line"),
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Preset;
    use crate::session::SessionId;

    fn spec(preset: Preset) -> RecordingSpec {
        RecordingSpec {
            session_id: SessionId::from("sess"),
            preset,
            labels: BTreeMap::from([("team".to_string(), "payments".to_string())]),
        }
    }

    fn event(category: &str, name: &str) -> CustomEvent {
        CustomEvent::new(category, name)
    }

    #[test]
    fn emit_without_recordings_is_noop() {
        let engine = CaptureEngine::new();
        engine.emit(event("app", "tick"));
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn recordings_are_independent_and_filtered() {
        let engine = CaptureEngine::new();
        let all = engine.begin(&spec(Preset::new("default"))).unwrap();
        let io = engine
            .begin(&spec(Preset::new("io").with_categories(["io"])))
            .unwrap();
        assert_ne!(all, io);

        engine.emit(event("io", "read"));
        engine.emit(event("app", "checkpoint"));

        let all_lines = parse_capture(&engine.end(all).unwrap());
        let io_lines = parse_capture(&engine.end(io).unwrap());
        assert_eq!(all_lines.len(), 4);
        assert_eq!(io_lines.len(), 3);
        assert!(matches!(&io_lines[1], CaptureLine::Event { name, .. } if name == "read"));
        assert!(matches!(
            &io_lines[0],
            CaptureLine::Header { labels, .. } if labels["team"] == "payments"
        ));
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn overflow_is_reported_in_footer() {
        let engine = CaptureEngine::new();
        let mut preset = Preset::new("tiny");
        preset.max_events = 2;
        let handle = engine.begin(&spec(preset)).unwrap();
        for i in 0..5 {
            engine.emit(event("app", &format!("e{i}")));
        }
        let lines = parse_capture(&engine.end(handle).unwrap());
        match lines.last().unwrap() {
            CaptureLine::Footer { events, dropped, overflowed, .. } => {
                assert_eq!(*events, 2);
                assert_eq!(*dropped, 3);
                assert!(*overflowed);
            }
            other => panic!("expected footer, got {other:?}"),
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let engine = CaptureEngine::with_max_active(1);
        let first = engine.begin(&spec(Preset::new("default"))).unwrap();
        assert!(matches!(
            engine.begin(&spec(Preset::new("default"))),
            Err(EngineError::Unavailable(_))
        ));
        engine.end(first).unwrap();
        assert!(engine.begin(&spec(Preset::new("default"))).is_ok());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let lines = parse_capture(b"{\"type\":\"footer\",\"events\":0,\"dropped\":0,\"overflowed\":false,\"duration_ms\":1}\nnot json\n\n");
        assert_eq!(lines.len(), 1);
    }
}

//! Fire-and-forget custom events.
//!
//! Instrumented code sends events through an [`EventSink`]; a forwarding task
//! hands them to the engine. The sink never blocks and never touches session
//! state, so it stays usable whatever the registry is doing.

use super::ProfilingEngine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// An application-defined event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub category: String,
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CustomEvent {
    /// Event with no payload.
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a JSON payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Non-blocking handle for emitting custom events.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<CustomEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Start a forwarding task feeding `engine`. The task ends once every
    /// sink clone has been dropped.
    pub fn spawn(engine: Arc<dyn ProfilingEngine>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<CustomEvent>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                engine.emit(event);
            }
            debug!("event forwarder stopped");
        });
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            task,
        )
    }

    /// Queue an event. Returns `false` (and counts a drop) when the queue is full.
    pub fn emit(&self, event: CustomEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Events discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

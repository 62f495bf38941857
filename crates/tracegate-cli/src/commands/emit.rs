//! `tracegate emit`: send a custom event to active recordings.

use crate::client::ControlClient;
use anyhow::{Context, Result};
use serde_json::Value;
use tracegate_core::{ControlRequest, CustomEvent};

/// Build an event, parsing `payload` as JSON.
pub fn build_event(category: &str, name: &str, payload: Option<&str>) -> Result<CustomEvent> {
    let event = CustomEvent::new(category, name);
    match payload {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).context("payload must be valid JSON")?;
            Ok(event.with_payload(value))
        }
        None => Ok(event),
    }
}

/// Send one event and report whether the server queued it.
pub async fn run(client: &mut ControlClient, category: &str, name: &str, payload: Option<&str>) -> Result<()> {
    let event = build_event(category, name, payload)?;
    let body = client.call(ControlRequest::Emit { event }).await?;
    if body["accepted"].as_bool() != Some(true) {
        eprintln!("tracegate: event dropped (server queue full)");
    }
    Ok(())
}

//! `tracegate start` / `stop` / `get` / `list` / `fetch`: session management.

use crate::client::ControlClient;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracegate_core::{
    ControlRequest, RecordingConfig, SessionFilter, SessionId, SessionState, SessionSummary,
};

/// Parse a `key=value` tag.
pub fn parse_tag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

/// Parse a session state name, case-insensitively.
pub fn parse_state(s: &str) -> Result<SessionState, String> {
    serde_json::from_value(Value::String(s.to_ascii_lowercase()))
        .map_err(|_| format!("unknown state '{s}'"))
}

/// Start a session and print its ID.
pub async fn run_start(
    client: &mut ControlClient,
    preset: &str,
    duration: Option<u64>,
    label: Option<String>,
    tags: Vec<(String, String)>,
    json: bool,
) -> Result<()> {
    let mut config = RecordingConfig::new(preset);
    if let Some(secs) = duration {
        config = config.with_max_duration(Duration::from_secs(secs));
    }
    if let Some(label) = label {
        config = config.with_label(label);
    }
    for (k, v) in tags {
        config = config.with_tag(k, v);
    }

    let body = client.call(ControlRequest::Start { config }).await?;
    if json {
        return print_json(&body);
    }
    let summary: SessionSummary = serde_json::from_value(body).context("unexpected response")?;
    println!("{}", summary.id);
    Ok(())
}

/// Stop a session and print where its artifact went.
pub async fn run_stop(client: &mut ControlClient, id: &str, json: bool) -> Result<()> {
    let body = client
        .call(ControlRequest::Stop {
            session_id: SessionId::from(id),
        })
        .await?;
    if json {
        return print_json(&body);
    }
    match body["outcome"].as_str() {
        Some("stopped") => {
            let artifact = &body["artifact"];
            println!(
                "{} ({} bytes)",
                artifact["location"].as_str().unwrap_or("-"),
                artifact["size"].as_u64().unwrap_or(0)
            );
        }
        _ => println!(
            "session {id} already {}",
            body["state"].as_str().unwrap_or("stopped")
        ),
    }
    Ok(())
}

pub async fn run_get(client: &mut ControlClient, id: &str) -> Result<()> {
    let body = client
        .call(ControlRequest::Get {
            session_id: SessionId::from(id),
        })
        .await?;
    print_json(&body)
}

/// List sessions as a table.
pub async fn run_list(client: &mut ControlClient, filter: SessionFilter, json: bool) -> Result<()> {
    let body = client.call(ControlRequest::List { filter }).await?;
    if json {
        return print_json(&body);
    }
    let sessions: Vec<SessionSummary> =
        serde_json::from_value(body["sessions"].clone()).context("unexpected response")?;
    print!("{}", format_sessions(&sessions));
    Ok(())
}

/// Download an artifact to `output`, or stdout.
pub async fn run_fetch(client: &mut ControlClient, id: &str, output: Option<&Path>) -> Result<()> {
    let body = client
        .call(ControlRequest::Fetch {
            session_id: SessionId::from(id),
        })
        .await?;
    let data = body["data"].as_str().context("response carries no data")?;
    let bytes = hex::decode(data).context("artifact data is not hex")?;
    match output {
        Some(path) => {
            std::fs::write(path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&bytes)?;
        }
    }
    Ok(())
}

fn print_json(body: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(body)?);
    Ok(())
}

/// Render sessions as a fixed-width table.
pub fn format_sessions(sessions: &[SessionSummary]) -> String {
    let mut out = format!(
        "{:<34} {:<12} {:<10} {:<10} {}\n",
        "SESSION", "OWNER", "STATE", "PRESET", "CREATED"
    );
    if sessions.is_empty() {
        out.push_str("(no sessions)\n");
        return out;
    }
    for s in sessions {
        out.push_str(&format!(
            "{:<34} {:<12} {:<10} {:<10} {}\n",
            s.id,
            s.owner,
            s.state,
            s.config.preset,
            s.created_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags() {
        assert_eq!(parse_tag("env=prod"), Ok(("env".into(), "prod".into())));
        assert_eq!(parse_tag("k=a=b"), Ok(("k".into(), "a=b".into())));
        assert!(parse_tag("novalue").is_err());
        assert!(parse_tag("=v").is_err());
    }

    #[test]
    fn states() {
        assert_eq!(parse_state("Running"), Ok(SessionState::Running));
        assert_eq!(parse_state("expired"), Ok(SessionState::Expired));
        assert!(parse_state("paused").is_err());
    }

    #[test]
    fn table_rows() {
        let summary: SessionSummary = serde_json::from_value(json!({
            "id": "abc123",
            "owner": "alice",
            "state": "running",
            "config": {"preset": "cpu"},
            "duration_ms": 60000,
            "created_at": "2026-01-02T03:04:05Z"
        }))
        .unwrap();
        let table = format_sessions(&[summary]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("SESSION"));
        assert!(lines[1].starts_with("abc123"));
        assert!(lines[1].contains("running"));
        assert!(lines[1].contains("2026-01-02 03:04:05"));

        assert!(format_sessions(&[]).contains("(no sessions)"));
    }
}

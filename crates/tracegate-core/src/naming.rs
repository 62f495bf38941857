//! Artifact naming.
//!
//! Names are `{host}_{started}_{label}_{session_id}.{ext}`. The session ID is
//! always the last segment, so two sessions never share a name even when
//! they start within the same millisecond.

use crate::session::{Session, SessionId};
use chrono::{DateTime, Utc};

const MAX_LABEL_LEN: usize = 32;
const DEFAULT_EXTENSION: &str = "jsonl";

/// Deterministic artifact namer bound to one host identity.
#[derive(Debug, Clone)]
pub struct ArtifactNamer {
    host: String,
    extension: String,
}

impl ArtifactNamer {
    /// Namer for artifacts recorded on `host_id`.
    pub fn new(host_id: &str) -> Self {
        Self {
            host: sanitize_label(host_id).unwrap_or_else(|| "host".to_string()),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Use `extension` instead of the default.
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    /// Sanitised host component.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Name the artifact of a session.
    ///
    /// Uses the config label, falling back to the owner's principal name.
    pub fn name(&self, session: &Session) -> String {
        let started = session.started_at().unwrap_or(session.created_at);
        let label = session
            .config()
            .label
            .as_deref()
            .unwrap_or(session.owner().as_str());
        self.compose(started, Some(label), session.id())
    }

    /// Build a name from its parts.
    ///
    /// # Arguments
    ///
    /// * `started_at` - When the recording began; rendered in UTC.
    /// * `label` - Optional caller label, sanitised and dropped when empty.
    /// * `id` - Session ID, always present so names never collide.
    pub fn compose(&self, started_at: DateTime<Utc>, label: Option<&str>, id: &SessionId) -> String {
        let stamp = started_at.format("%Y%m%dT%H%M%S%3fZ");
        match label.and_then(sanitize_label) {
            Some(label) => format!("{}_{stamp}_{label}_{id}.{}", self.host, self.extension),
            None => format!("{}_{stamp}_{id}.{}", self.host, self.extension),
        }
    }
}

/// Reduce a label to `[A-Za-z0-9-]`, at most 32 chars. `None` if nothing survives.
pub fn sanitize_label(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(MAX_LABEL_LEN)
        .collect();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap()
    }

    #[test]
    fn compose_layout() {
        let namer = ArtifactNamer::new("web-01");
        let id = SessionId::from("0123456789abcdef0123456789abcdef");
        assert_eq!(
            namer.compose(at(), Some("checkout"), &id),
            "web-01_20261019T083005000Z_checkout_0123456789abcdef0123456789abcdef.jsonl"
        );
        assert_eq!(
            namer.compose(at(), None, &id),
            "web-01_20261019T083005000Z_0123456789abcdef0123456789abcdef.jsonl"
        );
    }

    #[test]
    fn same_instant_distinct_sessions() {
        let namer = ArtifactNamer::new("host");
        let names: HashSet<String> = (0..500)
            .map(|_| namer.compose(at(), Some("same"), &SessionId::generate()))
            .collect();
        assert_eq!(names.len(), 500);
    }

    #[test]
    fn deterministic() {
        let namer = ArtifactNamer::new("host").with_extension(".trace");
        let id = SessionId::from("abc");
        let a = namer.compose(at(), Some("x"), &id);
        assert_eq!(a, namer.compose(at(), Some("x"), &id));
        assert!(a.ends_with(".trace"));
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_label("api/v1 load"), Some("api-v1-load".to_string()));
        assert_eq!(sanitize_label("../../etc"), Some("etc".to_string()));
        assert_eq!(sanitize_label("  "), None);
        assert_eq!(sanitize_label("***"), None);
        assert_eq!(sanitize_label(&"a".repeat(100)).unwrap().len(), 32);
    }

    #[test]
    fn unusable_host_falls_back() {
        assert_eq!(ArtifactNamer::new("..").host(), "host");
        assert_eq!(ArtifactNamer::new("db.internal").host(), "db-internal");
    }
}

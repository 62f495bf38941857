//! Registry snapshot file.

use anyhow::{Context, Result};
use std::path::Path;
use tracegate_core::RegistrySnapshot;
use tracing::{debug, warn};

/// Write `snapshot` to `path` atomically (temp file + rename).
pub async fn save_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    debug!(path = %path.display(), sessions = snapshot.sessions.len(), "snapshot saved");
    Ok(())
}

/// Read a snapshot written by a previous run.
///
/// A missing file yields `None`; a corrupt one is logged and ignored.
pub async fn load_snapshot(path: &Path) -> Result<Option<RegistrySnapshot>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable snapshot");
            Ok(None)
        }
    }
}

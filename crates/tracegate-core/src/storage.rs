//! Artifact storage boundary.

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

const MEMORY_SCHEME: &str = "mem://";

/// Where finished recordings go.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` under `name`, returning an opaque location.
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<String, StorageError>;

    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StorageError>;
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// One file per artifact under a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    /// Store artifacts under `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory artifacts are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<String, StorageError> {
        validate_name(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write then rename so a reader never sees a partial artifact.
        let partial = self.dir.join(format!(".{name}.partial"));
        let path = self.dir.join(name);
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &path).await?;

        debug!(path = %path.display(), size = bytes.len(), "artifact stored");
        Ok(path.display().to_string())
    }

    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let path = Path::new(location);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidName(location.to_string()))?;
        validate_name(name)?;
        if path.parent() != Some(self.dir.as_path()) {
            return Err(StorageError::InvalidName(location.to_string()));
        }
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(location.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    items: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<String, StorageError> {
        validate_name(name)?;
        self.items
            .write()
            .await
            .insert(name.to_string(), bytes.to_vec());
        Ok(format!("{MEMORY_SCHEME}{name}"))
    }

    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let name = location
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| StorageError::InvalidName(location.to_string()))?;
        self.items
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path().join("artifacts"));

        let location = store.store("host_1_abc.jsonl", b"{}\n").await.unwrap();
        assert!(location.ends_with("host_1_abc.jsonl"));
        assert_eq!(store.fetch(&location).await.unwrap(), b"{}\n");

        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn fs_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        assert!(matches!(
            store.store("../escape", b"x").await,
            Err(StorageError::InvalidName(_))
        ));
        assert!(matches!(
            store.fetch("/etc/passwd").await,
            Err(StorageError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn fs_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let location = dir.path().join("gone.jsonl").display().to_string();
        assert!(matches!(
            store.fetch(&location).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_store() {
        let store = MemoryArtifactStore::new();
        let location = store.store("a.jsonl", b"data").await.unwrap();
        assert_eq!(location, "mem://a.jsonl");
        assert_eq!(store.fetch(&location).await.unwrap(), b"data");
        assert_eq!(store.len().await, 1);
        assert!(matches!(
            store.fetch("mem://b.jsonl").await,
            Err(StorageError::NotFound(_))
        ));
    }
}

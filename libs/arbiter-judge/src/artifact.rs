//! Code artifact store: stable identifier in, source bytes out.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{JudgeError, Result};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Vec<u8>>;

    /// Drops an artifact once its submission is finished; missing ids are fine
    async fn discard(&self, id: &str);
}

/// Artifacts as files under one directory
#[derive(Debug, Clone)]
pub struct DirArtifactStore {
    root: PathBuf,
}

impl DirArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Only a bare file name is accepted as an id
    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let mut components = Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(id)),
            _ => Err(JudgeError::MissingArtifact(format!(
                "invalid artifact id: {:?}",
                id
            ))),
        }
    }

    /// Stores `bytes` as `<millis>_<uuid><extension>` and returns the id
    pub async fn put(&self, extension: &str, bytes: &[u8]) -> Result<String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| JudgeError::MissingArtifact(format!("{}: {}", self.root.display(), e)))?;

        let id = format!(
            "{}_{}{}",
            chrono::Utc::now().timestamp_millis(),
            Uuid::new_v4().simple(),
            extension
        );
        let path = self.path_for(&id)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| JudgeError::MissingArtifact(format!("{}: {}", path.display(), e)))?;
        debug!(artifact = %id, bytes = bytes.len(), "artifact stored");
        Ok(id)
    }

    /// Removes every file in the directory, used at shutdown
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(JudgeError::MissingArtifact(e.to_string())),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "could not remove artifact"),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl ArtifactStore for DirArtifactStore {
    async fn load(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(id)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| JudgeError::MissingArtifact(format!("{}: {}", id, e)))
    }

    async fn discard(&self, id: &str) {
        let Ok(path) = self.path_for(id) else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(artifact = %id, "artifact discarded"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(artifact = %id, error = %e, "could not discard artifact"),
        }
    }
}

/// In-process artifacts
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bytes: impl Into<Vec<u8>>) -> String {
        let id = Uuid::new_v4().to_string();
        self.artifacts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), bytes.into());
        id
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn load(&self, id: &str) -> Result<Vec<u8>> {
        self.artifacts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| JudgeError::MissingArtifact(id.to_string()))
    }

    async fn discard(&self, id: &str) {
        self.artifacts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

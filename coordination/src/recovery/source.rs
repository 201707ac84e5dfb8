//! Snapshot sources
//!
//! The persistence layer is the sole authority on round progress. This
//! module defines the read boundary and two implementations: an in-memory
//! map and a directory of `<stream_id>.json` documents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::RoundError;
use crate::model::StreamSnapshot;

/// Errors raised while fetching a snapshot
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Invalid stream id {0:?}")]
    InvalidStreamId(String),

    #[error("Failed to read snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed snapshot for stream {stream_id}: {source}")]
    Parse {
        stream_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Snapshot store unavailable: {0}")]
    Unavailable(String),
}

impl SnapshotError {
    /// Whether the same fetch may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Unavailable(_))
    }
}

impl From<SnapshotError> for RoundError {
    fn from(err: SnapshotError) -> Self {
        if err.is_transient() {
            RoundError::transient("fetch_snapshot", err.to_string())
        } else {
            RoundError::validation(err.to_string())
        }
    }
}

/// Read access to persisted stream snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the snapshot for `stream_id`; `Ok(None)` when none exists
    async fn fetch_snapshot(&self, stream_id: &str) -> Result<Option<StreamSnapshot>, SnapshotError>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Snapshot map held in memory
#[derive(Default)]
pub struct MemorySnapshotSource {
    snapshots: RwLock<HashMap<String, StreamSnapshot>>,
}

impl MemorySnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: StreamSnapshot) {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.stream_id.clone(), snapshot);
    }

    pub fn remove(&self, stream_id: &str) -> Option<StreamSnapshot> {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id)
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn fetch_snapshot(&self, stream_id: &str) -> Result<Option<StreamSnapshot>, SnapshotError> {
        Ok(self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .cloned())
    }
}

// ============================================================================
// JSON files
// ============================================================================

/// Snapshots stored as `<dir>/<stream_id>.json`
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotSource {
    dir: PathBuf,
}

impl JsonFileSnapshotSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `stream_id`
    pub fn path_for(&self, stream_id: &str) -> Result<PathBuf, SnapshotError> {
        let valid = !stream_id.is_empty()
            && stream_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !stream_id.starts_with('.');
        if !valid {
            return Err(SnapshotError::InvalidStreamId(stream_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", stream_id)))
    }

    /// Persist `snapshot`, replacing any previous document
    pub async fn save(&self, snapshot: &StreamSnapshot) -> Result<PathBuf, SnapshotError> {
        let path = self.path_for(&snapshot.stream_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SnapshotError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let json = serde_json::to_string_pretty(snapshot).map_err(|source| SnapshotError::Parse {
            stream_id: snapshot.stream_id.clone(),
            source,
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|source| SnapshotError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(stream_id = %snapshot.stream_id, path = %path.display(), "Snapshot saved");
        Ok(path)
    }
}

#[async_trait]
impl SnapshotSource for JsonFileSnapshotSource {
    async fn fetch_snapshot(&self, stream_id: &str) -> Result<Option<StreamSnapshot>, SnapshotError> {
        let path = self.path_for(stream_id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SnapshotError::Io { path, source }),
        };
        let snapshot = serde_json::from_str(&raw).map_err(|source| SnapshotError::Parse {
            stream_id: stream_id.to_string(),
            source,
        })?;
        Ok(Some(snapshot))
    }
}

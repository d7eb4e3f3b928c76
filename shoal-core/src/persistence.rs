//! Progress snapshots for resuming downloads.
//!
//! The coordinator hands a `DownloadSnapshot` to a `PersistenceSink`
//! whenever the verified byte count changes and when it exits. Reopening a
//! download seeds the verifying file from `verified`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::range::Range;
use crate::source::DownloadIdentity;

/// Errors from saving or loading snapshots.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Snapshot I/O failed for {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Snapshot at {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Serializable progress of one download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub identity: DownloadIdentity,
    pub state: String,
    pub verified: Vec<Range>,
    pub partial: Vec<Range>,
    pub corrupt: Vec<Range>,
    pub lost_bytes: u64,
    pub hash_tree_root: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl DownloadSnapshot {
    /// Total verified bytes.
    pub fn verified_bytes(&self) -> u64 {
        self.verified.iter().map(Range::len).sum()
    }

    /// Ranges to seed the verifying file with when resuming.
    pub fn resume_ranges(&self) -> &[Range] {
        &self.verified
    }
}

/// Destination for snapshots.
pub trait PersistenceSink: Send + Sync {
    /// Stores `snapshot`, replacing any previous one for the same download.
    ///
    /// # Errors
    ///
    /// - `PersistenceError::Io` - If the snapshot could not be written
    fn save(&self, snapshot: &DownloadSnapshot) -> Result<(), PersistenceError>;
}

/// Sink that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

impl PersistenceSink for NoPersistence {
    fn save(&self, _snapshot: &DownloadSnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Stores each snapshot as pretty-printed JSON in one file.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored snapshot.
    ///
    /// # Errors
    ///
    /// - `PersistenceError::Io` - If the file cannot be read
    /// - `PersistenceError::Malformed` - If the contents are not a snapshot
    pub fn load(&self) -> Result<DownloadSnapshot, PersistenceError> {
        load_snapshot(&self.path)
    }
}

impl PersistenceSink for JsonSnapshotStore {
    fn save(&self, snapshot: &DownloadSnapshot) -> Result<(), PersistenceError> {
        let io_error = |e: std::io::Error| PersistenceError::Io {
            path: self.path.clone(),
            reason: e.to_string(),
        };
        let json = serde_json::to_string_pretty(snapshot).map_err(|e| PersistenceError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        // write then rename so a crash never leaves half a snapshot
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, json).map_err(io_error)?;
        std::fs::rename(&staging, &self.path).map_err(io_error)?;
        tracing::trace!("JsonSnapshotStore::save: {}", self.path.display());
        Ok(())
    }
}

/// Reads a snapshot written by [`JsonSnapshotStore`].
///
/// # Errors
///
/// - `PersistenceError::Io` - If the file cannot be read
/// - `PersistenceError::Malformed` - If the contents are not a snapshot
pub fn load_snapshot(path: &Path) -> Result<DownloadSnapshot, PersistenceError> {
    let contents = std::fs::read_to_string(path).map_err(|e| PersistenceError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|e| PersistenceError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::source::ContentHash;

    fn snapshot() -> DownloadSnapshot {
        DownloadSnapshot {
            identity: DownloadIdentity {
                file_name: "movie.bin".to_string(),
                file_size: 1_000_000,
                content_hash: Some(ContentHash::of(b"movie")),
            },
            state: "Downloading".to_string(),
            verified: vec![Range::new(0, 131_071).unwrap(), Range::new(262_144, 393_215).unwrap()],
            partial: vec![Range::new(500_000, 500_999).unwrap()],
            corrupt: Vec::new(),
            lost_bytes: 0,
            hash_tree_root: Some("root".to_string()),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("state").join("movie.json"));
        let original = snapshot();

        store.save(&original).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, original);
        assert_eq!(loaded.verified_bytes(), 262_144);
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_malformed_snapshot_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"identity\": 3}").unwrap();

        assert!(matches!(load_snapshot(&path), Err(PersistenceError::Malformed { .. })));
        assert!(matches!(
            load_snapshot(&dir.path().join("missing.json")),
            Err(PersistenceError::Io { .. })
        ));
    }
}

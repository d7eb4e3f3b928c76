//! Shoal Core - swarmed multi-source download engine
//!
//! Fetches one file from many untrusted sources at once: the file is split
//! into ranges leased to concurrent workers, written through a verifying
//! store that checks each chunk against a hash tree, and driven by a
//! coordinator that sizes the swarm, ranks sources and retries busy ones.
//! Network transport, discovery and completion handling are collaborators
//! supplied by the application.

pub mod config;
pub mod coordinator;
pub mod hash_tree;
pub mod hooks;
pub mod mesh;
pub mod persistence;
pub mod range;
pub mod ranker;
pub mod selection;
pub mod source;
pub mod storage;
pub mod tracing_setup;
pub mod transport;
pub mod verifying_file;
pub mod worker;

// Re-export main types for convenient access
pub use config::{ConfigError, ShoalConfig};
pub use coordinator::{
    DownloadError, DownloadHandle, DownloadServices, DownloadState, DownloadStatus, spawn_download,
};
pub use hash_tree::HashTree;
pub use persistence::{DownloadSnapshot, PersistenceError};
pub use range::{Range, RangeError, RangeSet};
pub use source::{ContentHash, DownloadIdentity, SourceDescriptor};
pub use storage::{DiskError, DiskStorage, FileDisk};
pub use transport::{SourceConnection, SourceTransport, TransportError};
pub use verifying_file::{VerifyingFile, VerifyingFileError};

/// Errors that can bubble up from any Shoal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Verifying file error: {0}")]
    VerifyingFile(#[from] VerifyingFileError),

    #[error("Disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("Range error: {0}")]
    Range(#[from] RangeError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ShoalError::Download(e) => match e {
                DownloadError::InvalidSource { reason } => format!("Source rejected: {reason}"),
                DownloadError::ActorShutdown => "Download is no longer running".to_string(),
            },
            ShoalError::VerifyingFile(VerifyingFileError::Disk(_)) | ShoalError::Disk(_) => {
                "Could not write the download to disk".to_string()
            }
            ShoalError::VerifyingFile(_) => "Download bookkeeping error occurred".to_string(),
            ShoalError::Range(e) => format!("Invalid byte range: {e}"),
            ShoalError::Persistence(PersistenceError::Malformed { path, .. }) => {
                format!("Snapshot {} is not readable", path.display())
            }
            ShoalError::Persistence(_) => "Could not access the download snapshot".to_string(),
            ShoalError::Config(e) => format!("Configuration error: {e}"),
            ShoalError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Config(_)
                | ShoalError::Range(_)
                | ShoalError::Download(DownloadError::InvalidSource { .. })
                | ShoalError::Persistence(PersistenceError::Malformed { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;

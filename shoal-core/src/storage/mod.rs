//! Disk layer for incomplete downloads.
//!
//! Defines the positional read/write interface the verifying file persists
//! through, the bounded write buffer pool, and a tokio-fs implementation.

pub mod buffer_pool;
pub mod file_disk;

use async_trait::async_trait;
use bytes::Bytes;
pub use buffer_pool::BufferPool;
pub use file_disk::FileDisk;

/// Positional storage for one incomplete file.
///
/// All methods take `&self`; implementations serialize access internally.
#[async_trait]
pub trait DiskStorage: Send + Sync {
    /// Creates or reopens the backing file for a download of `size` bytes.
    ///
    /// # Errors
    ///
    /// - `DiskError::Open` - If the directory or file cannot be created or made writable
    async fn open(&self, size: u64) -> Result<(), DiskError>;

    /// Writes `data` starting at `offset`.
    ///
    /// # Errors
    ///
    /// - `DiskError::NotOpen` - If `open` has not succeeded
    /// - `DiskError::Write` - If the underlying write failed
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DiskError>;

    /// Reads `len` bytes starting at `offset`.
    ///
    /// A closed file remains readable until it is deleted or quarantined.
    ///
    /// # Errors
    ///
    /// - `DiskError::NotOpen` - If the file does not exist
    /// - `DiskError::Read` - If the bytes could not be read back
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, DiskError>;

    /// Flushes written data to stable storage.
    ///
    /// # Errors
    ///
    /// - `DiskError::Io` - If syncing failed
    async fn flush(&self) -> Result<(), DiskError>;

    /// Releases the file handle. Idempotent.
    ///
    /// # Errors
    ///
    /// - `DiskError::Io` - If the final sync failed
    async fn close(&self) -> Result<(), DiskError>;

    /// Removes the incomplete file.
    ///
    /// # Errors
    ///
    /// - `DiskError::Io` - If removal failed
    async fn delete(&self) -> Result<(), DiskError>;

    /// Moves the incomplete file aside for later inspection.
    ///
    /// # Errors
    ///
    /// - `DiskError::Io` - If the rename failed
    async fn quarantine(&self) -> Result<(), DiskError>;
}

/// Errors that occur during disk operations.
///
/// Reasons are kept as strings so an error can be latched and surfaced more
/// than once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiskError {
    #[error("Failed to open incomplete file: {reason}")]
    Open { reason: String },

    #[error("Write of {len} bytes at offset {offset} failed: {reason}")]
    Write { offset: u64, len: usize, reason: String },

    #[error("Read of {len} bytes at offset {offset} failed: {reason}")]
    Read { offset: u64, len: usize, reason: String },

    #[error("Incomplete file is not open")]
    NotOpen,

    #[error("I/O error: {reason}")]
    Io { reason: String },
}

impl From<std::io::Error> for DiskError {
    fn from(error: std::io::Error) -> Self {
        DiskError::Io {
            reason: error.to_string(),
        }
    }
}

//! In-memory disk with failure injection.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use shoal_core::storage::{DiskError, DiskStorage};

#[derive(Debug, Default)]
struct DiskState {
    data: Option<Vec<u8>>,
    open: bool,
    quarantined: Option<Vec<u8>>,
    fail_open: bool,
    /// Writes fail once this many bytes have been written
    fail_writes_after: Option<u64>,
    bytes_written: u64,
    flushes: u32,
}

/// Incomplete file held in memory.
///
/// Like a file on disk, the contents survive `close` and stay readable
/// until `delete` or `quarantine`.
#[derive(Debug, Default)]
pub struct MemoryDisk {
    state: Mutex<DiskState>,
}

impl MemoryDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disk whose `open` always fails.
    pub fn failing_open() -> Self {
        let disk = Self::default();
        disk.state.lock().fail_open = true;
        disk
    }

    /// Disk that accepts `bytes` bytes of writes, then fails every write.
    pub fn failing_after(bytes: u64) -> Self {
        let disk = Self::default();
        disk.state.lock().fail_writes_after = Some(bytes);
        disk
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.state.lock().data.clone()
    }

    /// Contents moved aside by `quarantine`.
    pub fn quarantined(&self) -> Option<Vec<u8>> {
        self.state.lock().quarantined.clone()
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn flushes(&self) -> u32 {
        self.state.lock().flushes
    }
}

#[async_trait]
impl DiskStorage for MemoryDisk {
    async fn open(&self, size: u64) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(DiskError::Open {
                reason: "injected open failure".to_string(),
            });
        }
        let data = state.data.get_or_insert_with(Vec::new);
        data.resize(size as usize, 0);
        state.open = true;
        Ok(())
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(DiskError::NotOpen);
        }
        let len = bytes.len();
        if let Some(limit) = state.fail_writes_after
            && state.bytes_written + len as u64 > limit
        {
            return Err(DiskError::Write {
                offset,
                len,
                reason: "injected write failure".to_string(),
            });
        }

        let start = offset as usize;
        let data = state.data.as_mut().ok_or(DiskError::NotOpen)?;
        let target = data.get_mut(start..start + len).ok_or(DiskError::Write {
            offset,
            len,
            reason: "write past end of file".to_string(),
        })?;
        target.copy_from_slice(bytes);
        state.bytes_written += len as u64;
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, DiskError> {
        let state = self.state.lock();
        let data = state.data.as_ref().ok_or(DiskError::NotOpen)?;
        let start = offset as usize;
        data.get(start..start + len)
            .map(Bytes::copy_from_slice)
            .ok_or(DiskError::Read {
                offset,
                len,
                reason: "read past end of file".to_string(),
            })
    }

    async fn flush(&self) -> Result<(), DiskError> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), DiskError> {
        self.state.lock().open = false;
        Ok(())
    }

    async fn delete(&self) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        state.open = false;
        state.data = None;
        Ok(())
    }

    async fn quarantine(&self) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        state.open = false;
        state.quarantined = state.data.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readable_after_close() {
        let disk = MemoryDisk::new();
        disk.open(8).await.unwrap();
        disk.write_at(2, b"abc").await.unwrap();
        disk.close().await.unwrap();

        assert_eq!(disk.write_at(0, b"x").await, Err(DiskError::NotOpen));
        assert_eq!(&disk.read_at(2, 3).await.unwrap()[..], b"abc");

        disk.delete().await.unwrap();
        assert_eq!(disk.read_at(0, 1).await, Err(DiskError::NotOpen));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        assert!(MemoryDisk::failing_open().open(10).await.is_err());

        let disk = MemoryDisk::failing_after(4);
        disk.open(10).await.unwrap();
        disk.write_at(0, b"1234").await.unwrap();
        assert!(matches!(
            disk.write_at(4, b"5").await,
            Err(DiskError::Write { offset: 4, .. })
        ));
        assert_eq!(disk.bytes_written(), 4);
    }

    #[tokio::test]
    async fn test_quarantine_moves_contents() {
        let disk = MemoryDisk::new();
        disk.open(4).await.unwrap();
        disk.write_at(0, b"bad!").await.unwrap();
        disk.quarantine().await.unwrap();

        assert_eq!(disk.contents(), None);
        assert_eq!(disk.quarantined().as_deref(), Some(&b"bad!"[..]));
    }
}

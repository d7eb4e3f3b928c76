//! File-based disk implementation

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{DiskError, DiskStorage};

/// Incomplete file stored on the local file system.
///
/// A single handle is shared behind an async mutex; every positional
/// operation seeks then reads or writes while holding it.
pub struct FileDisk {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileDisk {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path a corrupt file is moved to by `quarantine`.
    pub fn quarantine_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".corrupt");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DiskStorage for FileDisk {
    async fn open(&self, size: u64) -> Result<(), DiskError> {
        let mut guard = self.file.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DiskError::Open {
                    reason: format!("{}: {e}", parent.display()),
                })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|e| DiskError::Open {
                reason: format!("{}: {e}", self.path.display()),
            })?;

        let current = file
            .metadata()
            .await
            .map_err(|e| DiskError::Open {
                reason: e.to_string(),
            })?
            .len();
        if current < size {
            file.set_len(size).await.map_err(|e| DiskError::Open {
                reason: e.to_string(),
            })?;
        }

        tracing::debug!("FileDisk::open: {} ({size} bytes)", self.path.display());
        *guard = Some(file);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DiskError> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(DiskError::NotOpen)?;
        let failed = |e: std::io::Error| DiskError::Write {
            offset,
            len: data.len(),
            reason: e.to_string(),
        };

        file.seek(SeekFrom::Start(offset)).await.map_err(failed)?;
        file.write_all(data).await.map_err(failed)?;
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, DiskError> {
        let failed = |e: std::io::Error| DiskError::Read {
            offset,
            len,
            reason: e.to_string(),
        };
        let mut guard = self.file.lock().await;
        let mut closed_handle;
        let file = match guard.as_mut() {
            Some(file) => file,
            None => {
                // closed files stay readable for whole-file hashing
                closed_handle = match File::open(&self.path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(DiskError::NotOpen);
                    }
                    Err(e) => return Err(failed(e)),
                };
                &mut closed_handle
            }
        };

        file.seek(SeekFrom::Start(offset)).await.map_err(failed)?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await.map_err(failed)?;
        Ok(Bytes::from(buffer))
    }

    async fn flush(&self) -> Result<(), DiskError> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DiskError> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<(), DiskError> {
        self.file.lock().await.take();
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn quarantine(&self) -> Result<(), DiskError> {
        self.file.lock().await.take();
        fs::rename(&self.path, self.quarantine_path()).await?;
        Ok(())
    }
}

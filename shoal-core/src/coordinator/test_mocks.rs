//! Mock collaborators for coordinator tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::hash_tree::HashTree;
use crate::range::Range;
use crate::source::SourceDescriptor;
use crate::storage::{DiskError, DiskStorage};
use crate::transport::{
    ConnectTarget, NegotiationOutcome, SourceConnection, SourceTransport, TransportError,
};

/// How a mock source answers.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Streams the requested range in chunks, sleeping `delay` before each
    Serve { chunk_size: usize, delay: Duration },
    Busy { retry_after: Duration },
    NotFound,
    RefuseConnect,
}

/// Transport serving one in-memory file from scripted sources.
pub struct MockTransport {
    content: Bytes,
    behaviors: HashMap<SocketAddr, MockBehavior>,
    connects: Mutex<Vec<SocketAddr>>,
}

impl MockTransport {
    pub fn new(content: Bytes) -> Self {
        Self {
            content,
            behaviors: HashMap::new(),
            connects: Mutex::new(Vec::new()),
        }
    }

    pub fn with_source(mut self, addr: SocketAddr, behavior: MockBehavior) -> Self {
        self.behaviors.insert(addr, behavior);
        self
    }

    /// Addresses connected to, in order.
    pub fn connects(&self) -> Vec<SocketAddr> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl SourceTransport for MockTransport {
    async fn connect(
        &self,
        _source: &SourceDescriptor,
        target: &ConnectTarget,
        _timeout: Duration,
    ) -> Result<Box<dyn SourceConnection>, TransportError> {
        let ConnectTarget::Direct(addr) = target else {
            return Err(TransportError::ConnectFailed {
                target: target.to_string(),
                reason: "mock sources are direct only".to_string(),
            });
        };
        let behavior = self.behaviors.get(addr).cloned().unwrap_or(MockBehavior::RefuseConnect);
        if matches!(behavior, MockBehavior::RefuseConnect) {
            return Err(TransportError::ConnectFailed {
                target: target.to_string(),
                reason: "refused".to_string(),
            });
        }
        self.connects.lock().push(*addr);
        Ok(Box::new(MockConnection {
            content: self.content.clone(),
            behavior,
            body: None,
        }))
    }
}

struct MockConnection {
    content: Bytes,
    behavior: MockBehavior,
    /// Next byte to send and last byte of the body
    body: Option<(u64, u64)>,
}

#[async_trait]
impl SourceConnection for MockConnection {
    async fn request_hash_tree(&mut self) -> Result<bool, TransportError> {
        Ok(false)
    }

    async fn read_hash_tree(&mut self) -> Result<Arc<dyn HashTree>, TransportError> {
        Err(TransportError::Io {
            reason: "no hash tree".to_string(),
        })
    }

    async fn consume_body(&mut self) -> Result<(), TransportError> {
        self.body = None;
        Ok(())
    }

    async fn negotiate_range(
        &mut self,
        range: Range,
        _supports_queueing: bool,
    ) -> Result<NegotiationOutcome, TransportError> {
        match &self.behavior {
            MockBehavior::Serve { .. } => {
                self.body = Some((range.low(), range.high()));
                Ok(NegotiationOutcome::Connected { range })
            }
            MockBehavior::Busy { retry_after } => Ok(NegotiationOutcome::Busy {
                retry_after: Some(*retry_after),
            }),
            MockBehavior::NotFound => Ok(NegotiationOutcome::NotFound),
            MockBehavior::RefuseConnect => Err(TransportError::Closed),
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        let MockBehavior::Serve { chunk_size, delay } = self.behavior.clone() else {
            return Ok(None);
        };
        let Some((next, last)) = self.body else {
            return Ok(None);
        };
        if next > last {
            self.body = None;
            return Ok(None);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let end = (next + chunk_size as u64).min(last + 1);
        self.body = Some((end, last));
        Ok(Some(self.content.slice(next as usize..end as usize)))
    }

    fn is_keep_alive(&self) -> bool {
        false
    }
}

/// In-memory disk.
#[derive(Default)]
pub struct MockDisk {
    data: Mutex<Option<Vec<u8>>>,
}

impl MockDisk {
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.data.lock().clone()
    }
}

#[async_trait]
impl DiskStorage for MockDisk {
    async fn open(&self, size: u64) -> Result<(), DiskError> {
        let mut data = self.data.lock();
        if data.is_none() {
            *data = Some(vec![0; size as usize]);
        }
        Ok(())
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), DiskError> {
        let mut data = self.data.lock();
        let data = data.as_mut().ok_or(DiskError::NotOpen)?;
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, DiskError> {
        let data = self.data.lock();
        let data = data.as_ref().ok_or(DiskError::NotOpen)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&data[start..start + len]))
    }

    async fn flush(&self) -> Result<(), DiskError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), DiskError> {
        Ok(())
    }

    async fn delete(&self) -> Result<(), DiskError> {
        self.data.lock().take();
        Ok(())
    }

    async fn quarantine(&self) -> Result<(), DiskError> {
        self.data.lock().take();
        Ok(())
    }
}

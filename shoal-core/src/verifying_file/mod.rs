//! Shared on-disk representation of one download.
//!
//! A `VerifyingFile` owns five disjoint range sets over the target file:
//! verified, partial (written, unverified), pending (queued for the disk),
//! leased (claimed by a worker) and corrupt. Every state transition happens
//! under one internal lock, so any number of workers may lease and write
//! concurrently. Disk writes and chunk verification run on a single
//! background task per file; the lock is never held across an await.

mod queue;
mod state;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;

use self::queue::DiskJob;
use self::state::{FileState, TreeUpdate};
use crate::config::{DiskConfig, VerificationConfig};
use crate::hash_tree::{HashTree, TreeInfo};
use crate::range::{Range, RangeError, RangeSet};
use crate::selection::{SelectionError, SelectionStrategy};
use crate::storage::{BufferPool, DiskError, DiskStorage};

/// Errors produced by verifying file operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyingFileError {
    #[error("Verifying file is not open")]
    NotOpen,

    #[error("No available range matches the request")]
    NoSuchElement,

    #[error("Disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("Invariant violation in {operation} on {range}: {dump}")]
    InvariantViolation {
        operation: &'static str,
        range: Range,
        dump: String,
    },

    #[error("Invalid range: {0}")]
    Range(#[from] RangeError),

    #[error("Selection failed: {0}")]
    Selection(#[from] SelectionError),

    #[error("Verifying file has been closed")]
    Closed,
}

/// Bytes received from the network destined for `position` in the file.
///
/// `buffer[offset..offset + length]` holds the payload; the rest of the
/// buffer is ignored.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub position: u64,
    pub offset: usize,
    pub length: usize,
    pub buffer: Bytes,
}

impl WriteRequest {
    /// Request covering all of `data`.
    pub fn new(position: u64, data: Bytes) -> Self {
        Self {
            position,
            offset: 0,
            length: data.len(),
            buffer: data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }

    /// File range the payload covers.
    ///
    /// # Errors
    ///
    /// - `RangeError::ZeroLength` - If the request carries no bytes
    pub fn range(&self) -> Result<Range, RangeError> {
        Range::from_len(self.position, self.length as u64)
    }
}

/// Callback run once a delayed write has been scheduled (or failed).
pub type WriteCallback = Box<dyn FnOnce(Result<(), VerifyingFileError>) + Send>;

/// Copy of the five range sets, taken under the lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRanges {
    pub verified: RangeSet,
    pub partial: RangeSet,
    pub pending: RangeSet,
    pub leased: RangeSet,
    pub corrupt: RangeSet,
}

/// Handle to a shared verifying file. Cloning is cheap.
#[derive(Clone)]
pub struct VerifyingFile {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<FileState>,
    changed: Notify,
    disk: Arc<dyn DiskStorage>,
    pool: BufferPool,
    queue: Mutex<Option<mpsc::UnboundedSender<DiskJob>>>,
    delayed: Mutex<VecDeque<(WriteRequest, WriteCallback)>>,
}

impl VerifyingFile {
    /// Creates an unopened file of `size` bytes backed by `disk`.
    pub fn new(
        size: u64,
        disk: Arc<dyn DiskStorage>,
        strategy: Box<dyn SelectionStrategy>,
        verification: VerificationConfig,
        disk_config: &DiskConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FileState::new(size, strategy, verification)),
                changed: Notify::new(),
                disk,
                pool: BufferPool::new(disk_config.write_buffers, disk_config.write_buffer_size),
                queue: Mutex::new(None),
                delayed: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Opens the backing storage and seeds `verified` from `resume` ranges.
    ///
    /// Must precede every other operation. Reopening a closed file is allowed
    /// and restarts the disk queue.
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::Disk` - If the directory or file cannot be created or made writable
    pub async fn open(&self, resume: &[Range]) -> Result<(), VerifyingFileError> {
        let size = self.inner.state.lock().size;
        self.inner.disk.open(size).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock();
            let bounds = RangeSet::full(size);
            let mut seeded: RangeSet = resume.iter().copied().collect();
            seeded.intersect_in_place(&bounds);

            state.verified = seeded;
            state.partial.clear();
            state.pending.clear();
            state.leased.clear();
            state.corrupt.clear();
            state.lost_size = 0;
            state.lost_size_for_tree = 0;
            state.stored_error = None;
            state.is_open = true;
            state.closed = false;
            tracing::debug!(
                "VerifyingFile::open: {size} bytes, resumed {} verified",
                state.verified.size()
            );
        }
        *self.inner.queue.lock() = Some(sender);

        tokio::spawn(queue::run_disk_queue(self.inner.clone(), receiver));
        Ok(())
    }

    /// Leases a white range for download.
    ///
    /// `candidates` restricts the choice to ranges the source can serve;
    /// `chunk_hint` caps the lease length.
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::NotOpen` - If the file is not open
    /// - `VerifyingFileError::NoSuchElement` - If no needed byte matches `candidates`
    /// - `VerifyingFileError::InvariantViolation` - If the strategy returned an unavailable range
    pub fn lease_white(
        &self,
        candidates: Option<&RangeSet>,
        chunk_hint: Option<u64>,
    ) -> Result<Range, VerifyingFileError> {
        let mut state = self.inner.state.lock();
        if !state.is_open {
            return Err(VerifyingFileError::NotOpen);
        }
        if state.closed {
            return Err(VerifyingFileError::Closed);
        }
        let range = state.lease_white(candidates, chunk_hint)?;
        tracing::debug!(
            "lease_white: leased {range} ({} bytes free)",
            state.free_bytes()
        );
        Ok(range)
    }

    /// Returns a leased range to the pool of white bytes.
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::InvariantViolation` - If `range` is not entirely leased
    pub fn release_block(&self, range: Range) -> Result<(), VerifyingFileError> {
        let mut state = self.inner.state.lock();
        state.release(range)?;
        tracing::debug!("release_block: released {range}");
        self.inner.changed.notify_waiters();
        Ok(())
    }

    /// Schedules `request` for writing.
    ///
    /// Returns `Ok(false)` when no write buffer is free; the caller retries
    /// later or uses [`Self::register_write_callback`].
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::InvariantViolation` - If the bytes are not leased
    /// - `VerifyingFileError::Closed` - If the disk queue has shut down
    pub fn write_block(&self, request: &WriteRequest) -> Result<bool, VerifyingFileError> {
        self.inner.write_block(request)
    }

    /// Writes `request` now if a buffer is free, otherwise parks it until one is.
    ///
    /// `callback` runs exactly once, with the outcome of scheduling the write.
    pub fn register_write_callback(&self, request: WriteRequest, callback: WriteCallback) {
        let mut delayed = self.inner.delayed.lock();
        match self.inner.write_block(&request) {
            Ok(false) => {
                tracing::trace!(
                    "register_write_callback: parked write at {} ({} delayed)",
                    request.position,
                    delayed.len() + 1
                );
                delayed.push_back((request, callback));
            }
            result => {
                drop(delayed);
                callback(result.map(|_| ()));
            }
        }
    }

    /// Schedules `request`, suspending until a write buffer is available.
    ///
    /// # Errors
    ///
    /// Same as [`Self::write_block`].
    pub async fn write_block_waiting(&self, request: WriteRequest) -> Result<(), VerifyingFileError> {
        let (sender, receiver) = oneshot::channel();
        self.register_write_callback(
            request,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );
        receiver.await.unwrap_or(Err(VerifyingFileError::Closed))
    }

    /// Waits, at most `max_wait`, while every byte is claimed but writes are
    /// still in flight.
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::Disk` - If a disk error has been latched
    pub async fn wait_for_pending_if_needed(
        &self,
        max_wait: Duration,
    ) -> Result<(), VerifyingFileError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock();
                if let Some(error) = &state.stored_error {
                    return Err(error.clone().into());
                }
                if !state.should_wait_for_pending() {
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Latched disk error, if any.
    pub fn stored_error(&self) -> Option<DiskError> {
        self.inner.state.lock().stored_error.clone()
    }

    /// Offers a hash tree; returns whether it was installed.
    ///
    /// Passing `None` drops the current tree.
    pub fn set_hash_tree(&self, tree: Option<Arc<dyn HashTree>>) -> bool {
        let update = self.inner.state.lock().set_hash_tree(tree);
        match update {
            TreeUpdate::Rejected => false,
            TreeUpdate::Accepted { verify } => {
                if verify {
                    self.inner.schedule(DiskJob::Verify);
                }
                self.inner.changed.notify_waiters();
                true
            }
        }
    }

    pub fn hash_tree(&self) -> Option<Arc<dyn HashTree>> {
        self.inner.state.lock().hash_tree.clone()
    }

    pub fn tree_info(&self) -> Option<TreeInfo> {
        self.inner.state.lock().tree_info()
    }

    /// Root any installed tree must match.
    pub fn set_expected_root(&self, root: impl Into<String>) {
        self.inner.state.lock().expected_root = Some(root.into());
    }

    /// Claims the single in-flight hash tree request slot.
    pub fn try_claim_hash_tree_request(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.hash_tree_requested {
            return false;
        }
        state.hash_tree_requested = true;
        true
    }

    pub fn clear_hash_tree_request(&self) {
        self.inner.state.lock().hash_tree_requested = false;
    }

    pub fn is_hash_tree_requested(&self) -> bool {
        self.inner.state.lock().hash_tree_requested
    }

    /// Chooses whether corrupt chunks are forgotten or kept in the corrupt set.
    pub fn set_discard_unverified(&self, discard: bool) {
        self.inner.state.lock().discard_corrupt = discard;
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().is_complete()
    }

    pub fn is_hopeless(&self) -> bool {
        self.inner.state.lock().is_hopeless()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().is_open
    }

    /// Unclaimed bytes remaining.
    pub fn has_free_blocks_to_assign(&self) -> u64 {
        self.inner.state.lock().free_bytes()
    }

    pub fn size(&self) -> u64 {
        self.inner.state.lock().size
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.state.lock().chunk_size()
    }

    pub fn lost_size(&self) -> u64 {
        self.inner.state.lock().lost_size
    }

    pub fn verified_size(&self) -> u64 {
        self.inner.state.lock().verified.size()
    }

    pub fn pending_size(&self) -> u64 {
        self.inner.state.lock().pending.size()
    }

    /// Bytes written to disk, verified or not.
    pub fn block_size(&self) -> u64 {
        let state = self.inner.state.lock();
        state.verified.size() + state.partial.size()
    }

    /// Bytes from the start of the file that can be previewed.
    pub fn preview_offset(&self) -> u64 {
        self.inner.state.lock().preview_offset()
    }

    pub fn verified_ranges(&self) -> RangeSet {
        self.inner.state.lock().verified.clone()
    }

    pub fn serializable_ranges(&self) -> RangeSet {
        self.inner.state.lock().serializable_ranges()
    }

    pub fn ranges(&self) -> FileRanges {
        let state = self.inner.state.lock();
        FileRanges {
            verified: state.verified.clone(),
            partial: state.partial.clone(),
            pending: state.pending.clone(),
            leased: state.leased.clone(),
            corrupt: state.corrupt.clone(),
        }
    }

    pub fn dump_state(&self) -> String {
        self.inner.state.lock().dump()
    }

    /// Waits for in-flight and parked writes, then releases the file handle.
    ///
    /// New leases are refused as soon as closing starts. Idempotent.
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::Disk` - If the final flush or close failed
    pub async fn close(&self) -> Result<(), VerifyingFileError> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let delayed = self.inner.delayed.lock();
                if delayed.is_empty() && self.inner.state.lock().jobs_in_flight == 0 {
                    break;
                }
            }
            notified.await;
        }

        self.inner.state.lock().is_open = false;
        self.inner.queue.lock().take();
        let parked: Vec<_> = self.inner.delayed.lock().drain(..).collect();
        for (_, callback) in parked {
            callback(Err(VerifyingFileError::Closed));
        }

        let flushed = self.inner.disk.flush().await;
        let closed = self.inner.disk.close().await;
        self.inner.changed.notify_waiters();
        tracing::debug!("VerifyingFile::close: closed");
        flushed.and(closed).map_err(Into::into)
    }

    /// Closes and removes the incomplete file.
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::Disk` - If removal failed
    pub async fn delete(&self) -> Result<(), VerifyingFileError> {
        self.close().await?;
        self.inner.disk.delete().await?;
        Ok(())
    }

    /// Closes the file and moves it aside.
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::Disk` - If the rename failed
    pub async fn quarantine(&self) -> Result<(), VerifyingFileError> {
        self.close().await?;
        self.inner.disk.quarantine().await?;
        Ok(())
    }

    /// Reads back `len` bytes at `offset`, for whole-file hashing.
    ///
    /// # Errors
    ///
    /// - `VerifyingFileError::Disk` - If the bytes cannot be read
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, VerifyingFileError> {
        Ok(self.inner.disk.read_at(offset, len).await?)
    }

    /// Completes when any range set changes.
    pub async fn changed(&self) {
        self.inner.changed.notified().await;
    }
}

impl Inner {
    fn write_block(&self, request: &WriteRequest) -> Result<bool, VerifyingFileError> {
        if request.length == 0 {
            return Ok(true);
        }
        let range = request.range()?;

        let job = {
            let mut state = self.state.lock();
            if !state.is_open {
                return Ok(true);
            }
            let Some(mut buffer) = self.pool.acquire_write_buffer() else {
                return Ok(false);
            };
            let pieces = match state.begin_write(range) {
                Ok(pieces) => pieces,
                Err(error) => {
                    self.pool.release(buffer);
                    return Err(error);
                }
            };
            buffer.extend_from_slice(request.data());
            state.jobs_in_flight += 1;
            tracing::trace!("write_block: scheduled {range}");
            DiskJob::Write {
                position: request.position,
                buffer,
                pieces,
            }
        };

        if let Err(rejected) = self.send(job) {
            if let DiskJob::Write { buffer, pieces, .. } = rejected {
                let mut state = self.state.lock();
                state.abort_write(&pieces);
                state.jobs_in_flight = state.jobs_in_flight.saturating_sub(1);
                self.pool.release(buffer);
            }
            return Err(VerifyingFileError::Closed);
        }
        Ok(true)
    }

    /// Enqueues a job that does not originate from a write.
    fn schedule(&self, job: DiskJob) {
        self.state.lock().jobs_in_flight += 1;
        if self.send(job).is_err() {
            let mut state = self.state.lock();
            state.jobs_in_flight = state.jobs_in_flight.saturating_sub(1);
        }
    }

    fn send(&self, job: DiskJob) -> Result<(), DiskJob> {
        match self.queue.lock().as_ref() {
            Some(sender) => sender.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Retries parked writes in FIFO order until buffers run out again.
    fn drain_delayed(&self) {
        loop {
            let (callback, result) = {
                let mut delayed = self.delayed.lock();
                let Some((request, callback)) = delayed.pop_front() else {
                    return;
                };
                match self.write_block(&request) {
                    Ok(false) => {
                        delayed.push_front((request, callback));
                        return;
                    }
                    result => (callback, result.map(|_| ())),
                }
            };
            callback(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;
    use tokio::test;

    use super::*;
    use crate::selection::RandomStrategy;
    use crate::storage::FileDisk;

    /// Disk that fails every write.
    struct BrokenDisk;

    #[async_trait]
    impl DiskStorage for BrokenDisk {
        async fn open(&self, _size: u64) -> Result<(), DiskError> {
            Ok(())
        }

        async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DiskError> {
            Err(DiskError::Write {
                offset,
                len: data.len(),
                reason: "disk full".to_string(),
            })
        }

        async fn read_at(&self, _offset: u64, _len: usize) -> Result<Bytes, DiskError> {
            Err(DiskError::NotOpen)
        }

        async fn flush(&self) -> Result<(), DiskError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), DiskError> {
            Ok(())
        }

        async fn delete(&self) -> Result<(), DiskError> {
            Ok(())
        }

        async fn quarantine(&self) -> Result<(), DiskError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct ZeroTree {
        size: u64,
        node_size: u64,
    }

    impl HashTree for ZeroTree {
        fn root(&self) -> &str {
            "zero"
        }

        fn file_size(&self) -> u64 {
            self.size
        }

        fn node_size(&self) -> u64 {
            self.node_size
        }

        fn depth(&self) -> u32 {
            4
        }

        fn verify(&self, _range: Range, data: &[u8]) -> bool {
            data.iter().all(|b| *b == 0)
        }
    }

    fn file_with(size: u64, disk: Arc<dyn DiskStorage>, buffers: usize) -> VerifyingFile {
        let strategy = RandomStrategy::new(Box::new(StdRng::seed_from_u64(3)), size);
        let disk_config = DiskConfig {
            write_buffers: buffers,
            write_buffer_size: 1024,
        };
        VerifyingFile::new(
            size,
            disk,
            Box::new(strategy),
            VerificationConfig::default(),
            &disk_config,
        )
    }

    fn r(low: u64, high: u64) -> Range {
        Range::new(low, high).unwrap()
    }

    #[test]
    async fn test_complete_only_after_write_confirmed() {
        let dir = tempdir().unwrap();
        let file = file_with(10_000, Arc::new(FileDisk::new(dir.path().join("f"))), 8);
        file.open(&[]).await.unwrap();

        let leased = file.lease_white(None, Some(10_000)).unwrap();
        assert_eq!(leased, r(0, 9_999));

        let request = WriteRequest::new(0, Bytes::from(vec![7u8; 10_000]));
        assert!(file.write_block(&request).unwrap());
        assert!(!file.is_complete());
        assert_eq!(file.pending_size() + file.block_size(), 10_000);

        file.close().await.unwrap();
        assert!(file.is_complete());
        assert_eq!(file.ranges().partial.to_vec(), vec![r(0, 9_999)]);
    }

    #[test]
    async fn test_write_outside_lease_is_violation() {
        let dir = tempdir().unwrap();
        let file = file_with(1000, Arc::new(FileDisk::new(dir.path().join("f"))), 8);
        file.open(&[]).await.unwrap();

        let request = WriteRequest::new(0, Bytes::from_static(b"abc"));
        let err = file.write_block(&request).unwrap_err();
        assert!(matches!(
            err,
            VerifyingFileError::InvariantViolation {
                operation: "write_block",
                ..
            }
        ));
    }

    #[test]
    async fn test_not_open_write_is_noop() {
        let file = file_with(1000, Arc::new(BrokenDisk), 8);
        let request = WriteRequest::new(0, Bytes::from_static(b"abc"));
        assert!(file.write_block(&request).unwrap());
        assert!(matches!(
            file.lease_white(None, None),
            Err(VerifyingFileError::NotOpen)
        ));
    }

    #[test]
    async fn test_exhausted_buffers_park_writes() {
        let dir = tempdir().unwrap();
        let file = file_with(4096, Arc::new(FileDisk::new(dir.path().join("f"))), 1);
        file.open(&[]).await.unwrap();

        let mut leases = Vec::new();
        while let Ok(range) = file.lease_white(None, Some(1024)) {
            leases.push(range);
        }
        assert_eq!(leases.len(), 4);

        let done = Arc::new(AtomicUsize::new(0));
        let mut scheduled_now = 0;
        for range in &leases {
            let request = WriteRequest::new(range.low(), Bytes::from(vec![1u8; range.len() as usize]));
            let done = done.clone();
            file.register_write_callback(
                request,
                Box::new(move |result| {
                    assert!(result.is_ok());
                    done.fetch_add(1, Ordering::SeqCst);
                }),
            );
            scheduled_now += 1;
        }
        assert_eq!(scheduled_now, 4);

        file.close().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert!(file.is_complete());
    }

    #[test]
    async fn test_disk_error_surfaces_on_wait() {
        let file = file_with(100, Arc::new(BrokenDisk), 8);
        file.open(&[]).await.unwrap();

        let range = file.lease_white(None, Some(100)).unwrap();
        file.write_block_waiting(WriteRequest::new(range.low(), Bytes::from(vec![0u8; 100])))
            .await
            .unwrap();

        let mut surfaced = None;
        for _ in 0..50 {
            match file.wait_for_pending_if_needed(Duration::from_millis(20)).await {
                Err(error) => {
                    surfaced = Some(error);
                    break;
                }
                Ok(()) => tokio::task::yield_now().await,
            }
        }
        assert!(matches!(surfaced, Some(VerifyingFileError::Disk(DiskError::Write { .. }))));
        assert!(file.stored_error().is_some());
        assert_eq!(file.has_free_blocks_to_assign(), 100);
    }

    #[test]
    async fn test_chunks_verified_after_write() {
        let dir = tempdir().unwrap();
        let file = file_with(2048, Arc::new(FileDisk::new(dir.path().join("f"))), 8);
        file.open(&[]).await.unwrap();
        assert!(file.set_hash_tree(Some(Arc::new(ZeroTree {
            size: 2048,
            node_size: 1024
        }))));

        let first = file.lease_white(Some(&RangeSet::from_range(r(0, 1023))), None).unwrap();
        let second = file.lease_white(None, None).unwrap();
        assert_eq!(first, r(0, 1023));
        assert_eq!(second, r(1024, 2047));

        file.write_block_waiting(WriteRequest::new(0, Bytes::from(vec![0u8; 1024])))
            .await
            .unwrap();
        file.write_block_waiting(WriteRequest::new(1024, Bytes::from(vec![9u8; 1024])))
            .await
            .unwrap();
        file.close().await.unwrap();

        let ranges = file.ranges();
        assert_eq!(ranges.verified.to_vec(), vec![r(0, 1023)]);
        assert!(ranges.partial.is_empty());
        assert_eq!(file.lost_size(), 1024);
        assert!(!file.is_complete());
        assert_eq!(file.has_free_blocks_to_assign(), 1024);
    }

    #[test]
    async fn test_resume_seeds_verified() {
        let dir = tempdir().unwrap();
        let file = file_with(1000, Arc::new(FileDisk::new(dir.path().join("f"))), 8);
        file.open(&[r(0, 499), r(900, 1500)]).await.unwrap();

        assert_eq!(file.verified_ranges().to_vec(), vec![r(0, 499), r(900, 999)]);
        assert_eq!(file.has_free_blocks_to_assign(), 400);
        assert_eq!(file.preview_offset(), 500);
    }

    #[test]
    async fn test_hash_tree_request_claimed_once() {
        let file = file_with(1000, Arc::new(BrokenDisk), 8);
        assert!(file.try_claim_hash_tree_request());
        assert!(!file.try_claim_hash_tree_request());
        file.clear_hash_tree_request();
        assert!(file.try_claim_hash_tree_request());
    }

    #[test]
    async fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let file = file_with(1000, Arc::new(FileDisk::new(dir.path().join("f"))), 8);
        file.open(&[]).await.unwrap();
        file.close().await.unwrap();
        file.close().await.unwrap();
        assert!(!file.is_open());
    }
}

//! Integration tests for the verifying file through the public API, backed
//! by a real file on disk.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shoal_core::config::ShoalConfig;
use shoal_core::range::{Range, RangeSet};
use shoal_core::selection::strategy_for;
use shoal_core::storage::FileDisk;
use shoal_core::verifying_file::{VerifyingFile, VerifyingFileError, WriteRequest};
use tempfile::tempdir;

fn content(size: usize) -> Bytes {
    Bytes::from((0..size).map(|i| (i % 253) as u8).collect::<Vec<u8>>())
}

fn open_file(size: u64, disk: Arc<FileDisk>, seed: u64) -> VerifyingFile {
    let config = ShoalConfig::for_testing();
    let strategy = strategy_for(
        &config.selection,
        Box::new(ChaCha8Rng::seed_from_u64(seed)),
        size,
    );
    VerifyingFile::new(size, disk, strategy, config.verification, &config.disk)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_fill_file_without_overlap() {
    let dir = tempdir().unwrap();
    let data = content(1_000_000);
    let disk = Arc::new(FileDisk::new(dir.path().join("download.bin")));
    let file = open_file(data.len() as u64, disk.clone(), 11);
    file.open(&[]).await.unwrap();

    let leases = Arc::new(Mutex::new(Vec::<Range>::new()));
    let mut tasks = Vec::new();
    for _ in 0..6 {
        let file = file.clone();
        let data = data.clone();
        let leases = leases.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let range = match file.lease_white(None, Some(16 * 1024)) {
                    Ok(range) => range,
                    Err(VerifyingFileError::NoSuchElement) => break,
                    Err(error) => panic!("lease failed: {error}"),
                };
                leases.lock().push(range);
                let slice = data.slice(range.low() as usize..=range.high() as usize);
                file.write_block_waiting(WriteRequest::new(range.low(), slice))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    file.close().await.unwrap();

    let leases = leases.lock().clone();
    let mut covered = RangeSet::new();
    for range in &leases {
        assert!(!covered.contains_any(range), "{range} leased twice");
        covered.add(*range);
    }
    assert_eq!(covered, RangeSet::full(data.len() as u64));
    assert!(file.is_complete());
    assert_eq!(file.has_free_blocks_to_assign(), 0);

    let written = tokio::fs::read(disk.path()).await.unwrap();
    assert_eq!(&written[..], &data[..]);
}

#[tokio::test]
async fn test_resume_then_finish_remaining_bytes() {
    let dir = tempdir().unwrap();
    let data = content(300_000);
    let disk = Arc::new(FileDisk::new(dir.path().join("resumed.bin")));
    let file = open_file(data.len() as u64, disk, 3);

    let resumed = Range::new(0, 99_999).unwrap();
    file.open(&[resumed]).await.unwrap();
    assert_eq!(file.verified_size(), 100_000);
    assert_eq!(file.has_free_blocks_to_assign(), 200_000);

    let remaining = RangeSet::from_range(Range::new(100_000, 299_999).unwrap());
    while let Ok(range) = file.lease_white(Some(&remaining), None) {
        assert!(range.low() >= 100_000);
        let slice = data.slice(range.low() as usize..=range.high() as usize);
        file.write_block_waiting(WriteRequest::new(range.low(), slice))
            .await
            .unwrap();
    }
    file.close().await.unwrap();

    assert!(file.is_complete());
    assert_eq!(file.preview_offset(), data.len() as u64);
}

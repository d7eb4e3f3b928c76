//! End-to-end coordinator tests against scripted sources.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::config::ShoalConfig;
    use crate::coordinator::test_mocks::{MockBehavior, MockDisk, MockTransport};
    use crate::coordinator::{
        DownloadError, DownloadHandle, DownloadServices, DownloadState, spawn_download,
    };
    use crate::source::{ContentHash, DownloadIdentity, SourceDescriptor};

    const FILE_NAME: &str = "shoal-test.bin";

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn content(size: usize) -> Bytes {
        Bytes::from((0..size).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
    }

    fn serve() -> MockBehavior {
        MockBehavior::Serve {
            chunk_size: 8 * 1024,
            delay: Duration::from_millis(5),
        }
    }

    fn identity(data: &Bytes, hash: Option<ContentHash>) -> DownloadIdentity {
        DownloadIdentity {
            file_name: FILE_NAME.to_string(),
            file_size: data.len() as u64,
            content_hash: hash,
        }
    }

    fn source(port: u16, data: &Bytes) -> SourceDescriptor {
        SourceDescriptor::direct(addr(port), FILE_NAME, data.len() as u64)
    }

    fn start(
        config: ShoalConfig,
        identity: DownloadIdentity,
        transport: Arc<MockTransport>,
    ) -> (DownloadHandle, Arc<MockDisk>) {
        let disk = Arc::new(MockDisk::default());
        let handle = spawn_download(
            config,
            identity,
            disk.clone(),
            transport,
            DownloadServices::default(),
        );
        (handle, disk)
    }

    async fn wait_for_state(handle: &DownloadHandle, target: DownloadState) {
        let mut receiver = handle.subscribe();
        let reached = receiver.wait_for(|state| *state == target).await;
        assert!(reached.is_ok(), "download never reached {target}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_source_completes() {
        let data = content(300_000);
        let transport = Arc::new(MockTransport::new(data.clone()).with_source(addr(1), serve()));
        let (handle, disk) = start(
            ShoalConfig::for_testing(),
            identity(&data, Some(ContentHash::of(&data))),
            transport.clone(),
        );

        assert_eq!(handle.add_sources(vec![source(1, &data)]).await, Ok(1));
        assert_eq!(handle.wait_for_terminal().await, DownloadState::Complete);

        assert_eq!(disk.contents().as_deref(), Some(&data[..]));
        let status = handle.status().await.unwrap();
        assert_eq!(status.verified_bytes + status.pending_bytes, data.len() as u64);
        assert_eq!(status.reason, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swarm_uses_every_source() {
        let data = content(600_000);
        let transport = Arc::new(
            MockTransport::new(data.clone())
                .with_source(addr(1), serve())
                .with_source(addr(2), serve())
                .with_source(addr(3), serve()),
        );
        let mut config = ShoalConfig::for_testing();
        config.swarm.fixed_capacity = Some(3);
        let (handle, disk) = start(config, identity(&data, None), transport.clone());

        let sources = vec![source(1, &data), source(2, &data), source(3, &data)];
        assert_eq!(handle.add_sources(sources).await, Ok(3));
        assert_eq!(handle.wait_for_terminal().await, DownloadState::Complete);

        assert_eq!(disk.contents().as_deref(), Some(&data[..]));
        let mut connected = transport.connects();
        connected.sort();
        connected.dedup();
        assert_eq!(connected, vec![addr(1), addr(2), addr(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_sources_rejected() {
        let data = content(10_000);
        let transport = Arc::new(MockTransport::new(data.clone()));
        let (handle, _disk) = start(ShoalConfig::for_testing(), identity(&data, None), transport);

        let other = SourceDescriptor::direct(addr(9), "other.bin", 10_000);
        let result = handle.add_sources(vec![other]).await;
        assert!(matches!(result, Err(DownloadError::InvalidSource { .. })));

        let wrong_size = SourceDescriptor::direct(addr(9), FILE_NAME, 20_000);
        let result = handle.add_sources(vec![wrong_size, source(1, &data)]).await;
        assert_eq!(result, Ok(1));

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_source_waits_for_retry() {
        let data = content(50_000);
        let transport = Arc::new(MockTransport::new(data.clone()).with_source(
            addr(1),
            MockBehavior::Busy {
                retry_after: Duration::from_secs(120),
            },
        ));
        let (handle, _disk) = start(ShoalConfig::for_testing(), identity(&data, None), transport);

        handle.add_sources(vec![source(1, &data)]).await.unwrap();
        wait_for_state(&handle, DownloadState::Busy).await;

        let status = handle.status().await.unwrap();
        let wait = status.retry_wait_ms.unwrap();
        assert!(wait > 0 && wait <= 120_000, "unexpected retry wait {wait}");
        assert_eq!(status.verified_bytes, 0);

        handle.stop().await.unwrap();
        assert_eq!(handle.wait_for_terminal().await, DownloadState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_file_gives_up() {
        let data = content(50_000);
        let transport = Arc::new(
            MockTransport::new(data.clone()).with_source(addr(1), MockBehavior::NotFound),
        );
        let (handle, _disk) = start(ShoalConfig::for_testing(), identity(&data, None), transport);

        handle.add_sources(vec![source(1, &data)]).await.unwrap();
        wait_for_state(&handle, DownloadState::GaveUp).await;

        handle.stop().await.unwrap();
        assert_eq!(handle.wait_for_terminal().await, DownloadState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_content_hash_is_corrupt() {
        let data = content(100_000);
        let transport = Arc::new(MockTransport::new(data.clone()).with_source(addr(1), serve()));
        let (handle, disk) = start(
            ShoalConfig::for_testing(),
            identity(&data, Some(ContentHash::of(b"something else"))),
            transport,
        );

        handle.add_sources(vec![source(1, &data)]).await.unwrap();
        assert_eq!(handle.wait_for_terminal().await, DownloadState::CorruptFile);

        assert_eq!(disk.contents(), None);
        let status = handle.status().await.unwrap();
        assert!(status.reason.unwrap().contains("does not match"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let data = content(400_000);
        let transport = Arc::new(MockTransport::new(data.clone()).with_source(
            addr(1),
            MockBehavior::Serve {
                chunk_size: 4 * 1024,
                delay: Duration::from_millis(50),
            },
        ));
        let (handle, disk) = start(ShoalConfig::for_testing(), identity(&data, None), transport);

        handle.add_sources(vec![source(1, &data)]).await.unwrap();
        wait_for_state(&handle, DownloadState::Downloading).await;

        handle.pause().await.unwrap();
        wait_for_state(&handle, DownloadState::Paused).await;
        let paused = handle.status().await.unwrap();
        assert_eq!(paused.active_workers, 0);
        assert!(paused.verified_bytes + paused.pending_bytes < data.len() as u64);

        // The pool keeps the source across the pause.
        handle.resume().await.unwrap();
        assert_eq!(handle.wait_for_terminal().await, DownloadState::Complete);
        assert_eq!(disk.contents().as_deref(), Some(&data[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let data = content(200_000);
        let transport = Arc::new(MockTransport::new(data.clone()).with_source(
            addr(1),
            MockBehavior::Serve {
                chunk_size: 1024,
                delay: Duration::from_millis(100),
            },
        ));
        let (handle, _disk) = start(ShoalConfig::for_testing(), identity(&data, None), transport);

        handle.add_sources(vec![source(1, &data)]).await.unwrap();
        wait_for_state(&handle, DownloadState::Downloading).await;

        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
        assert_eq!(handle.wait_for_terminal().await, DownloadState::Aborted);
        assert_eq!(handle.add_sources(vec![source(2, &data)]).await, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_file_is_invalid() {
        let transport = Arc::new(MockTransport::new(Bytes::new()));
        let identity = DownloadIdentity {
            file_name: FILE_NAME.to_string(),
            file_size: 0,
            content_hash: None,
        };
        let (handle, _disk) = start(ShoalConfig::for_testing(), identity, transport);

        assert_eq!(handle.wait_for_terminal().await, DownloadState::Invalid);
    }
}

//! Remote sources and their per-download retry state.
//!
//! A `SourceDescriptor` is what discovery tells us about a host that claims
//! to have the file. A `RemoteSourceContext` wraps it with everything the
//! download learns while talking to it: backoff deadline, failures, probe
//! round-trip time, advertised ranges and queue status. Contexts are shared
//! between the ranker and whichever worker currently uses the source.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::time::Instant;
use uuid::Uuid;

use crate::range::RangeSet;

/// SHA-1 identity of the file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 20]);

impl ContentHash {
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Hashes `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `hex::FromHexError` - If the string is not 20 bytes of hex
    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(value, &mut hash)?;
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// How a source can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceAddress {
    /// Reachable with an outgoing connection.
    Direct(SocketAddr),
    /// Firewalled; must be asked through one of its proxies to connect back.
    Relay {
        client_id: Uuid,
        proxies: Vec<SocketAddr>,
    },
    /// Learned from a multicast reply on the local network.
    MulticastHint(SocketAddr),
}

impl SourceAddress {
    pub fn is_relay(&self) -> bool {
        matches!(self, SourceAddress::Relay { .. })
    }
}

impl fmt::Display for SourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceAddress::Direct(addr) => write!(f, "{addr}"),
            SourceAddress::Relay { client_id, proxies } => {
                write!(f, "relay:{client_id} via {} proxies", proxies.len())
            }
            SourceAddress::MulticastHint(addr) => write!(f, "multicast:{addr}"),
        }
    }
}

/// Push endpoint a directly addressed source also advertises.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PushEndpoint {
    pub client_id: Uuid,
    pub proxies: Vec<SocketAddr>,
}

/// What a source claims to support.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub supports_queueing: bool,
    pub serves_hash_tree: bool,
    pub keep_alive: bool,
    /// Learned from another source's alternate-location list
    pub from_alt_location: bool,
    /// Answered a multicast query, so it is known to be alive
    pub multicast_reply: bool,
    /// Discovery-reported quality, higher is better
    pub quality: u8,
    /// Advertised upload speed
    pub speed_kbps: u32,
}

/// Immutable description of a candidate source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub address: SourceAddress,
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: Option<ContentHash>,
    pub capabilities: SourceCapabilities,
    /// Push route to try when a direct connection fails
    pub fallback_push: Option<PushEndpoint>,
}

impl SourceDescriptor {
    /// Direct source with default capabilities.
    pub fn direct(addr: SocketAddr, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            address: SourceAddress::Direct(addr),
            file_name: file_name.into(),
            file_size,
            content_hash: None,
            capabilities: SourceCapabilities::default(),
            fallback_push: None,
        }
    }

    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn with_capabilities(mut self, capabilities: SourceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Identity of the file a download is fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadIdentity {
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: Option<ContentHash>,
}

impl DownloadIdentity {
    /// Same content hash, or same name and size with no conflicting hash.
    pub fn matches(&self, source: &SourceDescriptor) -> bool {
        match (&self.content_hash, &source.content_hash) {
            (Some(ours), Some(theirs)) => ours == theirs && self.file_size == source.file_size,
            _ => self.file_name == source.file_name && self.file_size == source.file_size,
        }
    }
}

#[derive(Debug)]
struct SourceState {
    busy_until: Option<Instant>,
    failure_count: u32,
    rtt: Option<Duration>,
    available_ranges: Option<RangeSet>,
    queue_status: i32,
    hash_tree_failed: bool,
}

/// Shared handle to a source plus its mutable retry state.
///
/// Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct RemoteSourceContext {
    descriptor: Arc<SourceDescriptor>,
    state: Arc<Mutex<SourceState>>,
}

impl RemoteSourceContext {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            state: Arc::new(Mutex::new(SourceState {
                busy_until: None,
                failure_count: 0,
                rtt: None,
                available_ranges: None,
                queue_status: 0,
                hash_tree_failed: false,
            })),
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn address(&self) -> &SourceAddress {
        &self.descriptor.address
    }

    /// True while a retry-after deadline is in the future.
    pub fn is_busy(&self) -> bool {
        self.wait_time() > Duration::ZERO
    }

    /// Time left until the source may be tried again.
    pub fn wait_time(&self) -> Duration {
        match self.state.lock().busy_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Backs the source off for `delay` from now.
    pub fn set_retry_after(&self, delay: Duration) {
        tracing::debug!("set_retry_after: {} busy for {delay:?}", self.descriptor.address);
        self.state.lock().busy_until = Some(Instant::now() + delay);
    }

    pub fn clear_retry_after(&self) {
        self.state.lock().busy_until = None;
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Records a failure and returns the new count.
    pub fn increment_failures(&self) -> u32 {
        let mut state = self.state.lock();
        state.failure_count += 1;
        state.failure_count
    }

    pub fn reset_failures(&self) {
        self.state.lock().failure_count = 0;
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.state.lock().rtt
    }

    pub fn set_rtt(&self, rtt: Duration) {
        self.state.lock().rtt = Some(rtt);
    }

    /// Ranges a partial source advertised; None for complete sources.
    pub fn available_ranges(&self) -> Option<RangeSet> {
        self.state.lock().available_ranges.clone()
    }

    pub fn set_available_ranges(&self, ranges: RangeSet) {
        self.state.lock().available_ranges = Some(ranges);
    }

    pub fn clear_available_ranges(&self) {
        self.state.lock().available_ranges = None;
    }

    pub fn is_partial_source(&self) -> bool {
        self.state.lock().available_ranges.is_some()
    }

    /// Negative for free upload slots, positive for a queue position.
    pub fn queue_status(&self) -> i32 {
        self.state.lock().queue_status
    }

    pub fn set_queue_status(&self, status: i32) {
        self.state.lock().queue_status = status;
    }

    pub fn hash_tree_failed(&self) -> bool {
        self.state.lock().hash_tree_failed
    }

    pub fn set_hash_tree_failed(&self) {
        self.state.lock().hash_tree_failed = true;
    }

    /// Returns true if both handles share the same state.
    pub fn same_source(&self, other: &RemoteSourceContext) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Display for RemoteSourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descriptor.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Range;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_content_hash_hex_round_trip() {
        let hash = ContentHash::of(b"shoal");
        let parsed = ContentHash::from_hex(&hash.to_string()).unwrap();
        assert_eq!(parsed, hash);
        assert!(ContentHash::from_hex("abc").is_err());
    }

    #[test]
    fn test_identity_matching() {
        let hash = ContentHash::of(b"movie");
        let identity = DownloadIdentity {
            file_name: "movie.bin".to_string(),
            file_size: 1000,
            content_hash: Some(hash),
        };

        let same_hash = SourceDescriptor::direct(addr(1), "renamed.bin", 1000).with_hash(hash);
        let same_name = SourceDescriptor::direct(addr(2), "movie.bin", 1000);
        let conflicting = SourceDescriptor::direct(addr(3), "movie.bin", 1000)
            .with_hash(ContentHash::of(b"other"));
        let wrong_size = SourceDescriptor::direct(addr(4), "movie.bin", 999);

        assert!(identity.matches(&same_hash));
        assert!(identity.matches(&same_name));
        assert!(!identity.matches(&conflicting));
        assert!(!identity.matches(&wrong_size));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_expires() {
        let source = RemoteSourceContext::new(SourceDescriptor::direct(addr(1), "f", 10));
        assert!(!source.is_busy());

        source.set_retry_after(Duration::from_secs(120));
        assert!(source.is_busy());
        assert_eq!(source.wait_time(), Duration::from_secs(120));

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(source.is_busy());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!source.is_busy());
    }

    #[test]
    fn test_shared_state_between_clones() {
        let source = RemoteSourceContext::new(SourceDescriptor::direct(addr(1), "f", 10));
        let clone = source.clone();

        clone.increment_failures();
        clone.set_available_ranges(RangeSet::from_range(Range::new(0, 4).unwrap()));
        assert_eq!(source.failure_count(), 1);
        assert!(source.is_partial_source());
        assert!(source.same_source(&clone));

        source.reset_failures();
        source.clear_available_ranges();
        assert_eq!(clone.failure_count(), 0);
        assert!(!clone.is_partial_source());
    }
}

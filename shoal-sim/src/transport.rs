//! Scripted remote sources.
//!
//! Every source serves slices of one in-memory file according to its
//! [`SourceBehavior`]. Transfer pacing uses `tokio::time`, so runs under a
//! paused clock finish instantly and replay identically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use shoal_core::hash_tree::HashTree;
use shoal_core::range::{Range, RangeSet};
use shoal_core::source::{SourceAddress, SourceDescriptor};
use shoal_core::transport::{
    ConnectTarget, NegotiationOutcome, SourceConnection, SourceTransport, TransportError,
};

/// Byte pattern XORed into data served by corrupt sources.
const CORRUPTION_MASK: u8 = 0x5A;

/// How a source answers range requests.
#[derive(Debug, Clone)]
pub enum SourceKind {
    Serve,
    /// Serves the requested ranges with every byte altered
    Corrupt,
    Busy { retry_after: Option<Duration> },
    /// Answers queued `polls` times, then serves
    Queued {
        position: u32,
        poll_interval: Duration,
        polls: u32,
    },
    /// Holds only `available`
    Partial { available: RangeSet },
    NotFound,
    ContentMismatch,
    Unreachable,
}

impl SourceKind {
    /// Short name for reports.
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Serve => "serve",
            SourceKind::Corrupt => "corrupt",
            SourceKind::Busy { .. } => "busy",
            SourceKind::Queued { .. } => "queued",
            SourceKind::Partial { .. } => "partial",
            SourceKind::NotFound => "not-found",
            SourceKind::ContentMismatch => "content-mismatch",
            SourceKind::Unreachable => "unreachable",
        }
    }
}

/// Scripted behavior of one simulated source.
#[derive(Debug, Clone)]
pub struct SourceBehavior {
    pub kind: SourceKind,
    /// Upload speed; None streams without delay
    pub bytes_per_sec: Option<u64>,
    pub chunk_size: usize,
    /// Delay before every connect and every answer
    pub latency: Duration,
    pub hash_tree: Option<Arc<dyn HashTree>>,
    pub keep_alive: bool,
    /// False for firewalled sources only reachable by push
    pub direct_reachable: bool,
    pub alt_locations: Vec<SourceDescriptor>,
}

impl SourceBehavior {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            bytes_per_sec: None,
            chunk_size: 16 * 1024,
            latency: Duration::from_millis(20),
            hash_tree: None,
            keep_alive: true,
            direct_reachable: true,
            alt_locations: Vec::new(),
        }
    }

    pub fn serving() -> Self {
        Self::new(SourceKind::Serve)
    }

    /// Serving source limited to `bytes_per_sec`.
    pub fn slow(bytes_per_sec: u64) -> Self {
        Self::serving().with_speed(bytes_per_sec)
    }

    pub fn busy(retry_after: Duration) -> Self {
        Self::new(SourceKind::Busy {
            retry_after: Some(retry_after),
        })
    }

    pub fn queued(position: u32, poll_interval: Duration, polls: u32) -> Self {
        Self::new(SourceKind::Queued {
            position,
            poll_interval,
            polls,
        })
    }

    pub fn partial(available: RangeSet) -> Self {
        Self::new(SourceKind::Partial { available })
    }

    pub fn corrupt() -> Self {
        Self::new(SourceKind::Corrupt)
    }

    pub fn not_found() -> Self {
        Self::new(SourceKind::NotFound)
    }

    pub fn unreachable() -> Self {
        Self::new(SourceKind::Unreachable)
    }

    pub fn with_speed(mut self, bytes_per_sec: u64) -> Self {
        self.bytes_per_sec = Some(bytes_per_sec.max(1));
        self
    }

    pub fn with_hash_tree(mut self, tree: Arc<dyn HashTree>) -> Self {
        self.hash_tree = Some(tree);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn firewalled(mut self) -> Self {
        self.direct_reachable = false;
        self
    }

    pub fn with_alt_locations(mut self, sources: Vec<SourceDescriptor>) -> Self {
        self.alt_locations = sources;
        self
    }

    pub fn supports_queueing(&self) -> bool {
        matches!(self.kind, SourceKind::Queued { .. })
    }
}

/// What one source saw during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub connects: u32,
    pub requests: u32,
    pub queue_polls: u32,
    pub tree_requests: u32,
    pub bytes_served: u64,
    /// Ranges the source agreed to stream
    pub served_ranges: Vec<Range>,
}

type StatsMap = Arc<Mutex<HashMap<SourceAddress, SourceStats>>>;

/// Transport over scripted in-memory sources.
pub struct SimulatedTransport {
    content: Bytes,
    sources: HashMap<SourceAddress, SourceBehavior>,
    stats: StatsMap,
}

impl SimulatedTransport {
    pub fn new(content: Bytes) -> Self {
        Self {
            content,
            sources: HashMap::new(),
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_source(&mut self, address: SourceAddress, behavior: SourceBehavior) {
        self.sources.insert(address, behavior);
    }

    pub fn with_source(mut self, address: SourceAddress, behavior: SourceBehavior) -> Self {
        self.add_source(address, behavior);
        self
    }

    pub fn stats(&self, address: &SourceAddress) -> SourceStats {
        self.stats.lock().get(address).cloned().unwrap_or_default()
    }

    pub fn total_served(&self) -> u64 {
        self.stats.lock().values().map(|s| s.bytes_served).sum()
    }

    fn record(&self, address: &SourceAddress, update: impl FnOnce(&mut SourceStats)) {
        update(self.stats.lock().entry(address.clone()).or_default());
    }
}

#[async_trait]
impl SourceTransport for SimulatedTransport {
    async fn connect(
        &self,
        source: &SourceDescriptor,
        target: &ConnectTarget,
        timeout: Duration,
    ) -> Result<Box<dyn SourceConnection>, TransportError> {
        let refused = |reason: &str| TransportError::ConnectFailed {
            target: target.to_string(),
            reason: reason.to_string(),
        };
        let behavior = self
            .sources
            .get(&source.address)
            .cloned()
            .ok_or_else(|| refused("no such host"))?;

        if behavior.latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout {
                operation: "connect",
                elapsed: timeout,
            });
        }
        tokio::time::sleep(behavior.latency).await;

        match (&behavior.kind, target) {
            (SourceKind::Unreachable, _) => return Err(refused("host unreachable")),
            (_, ConnectTarget::Direct(_)) if !behavior.direct_reachable => {
                return Err(refused("firewalled"));
            }
            _ => {}
        }

        self.record(&source.address, |stats| stats.connects += 1);
        tracing::trace!("SimulatedTransport::connect: {} via {target}", source.address);
        Ok(Box::new(SimulatedConnection {
            address: source.address.clone(),
            content: self.content.clone(),
            behavior,
            stats: self.stats.clone(),
            body: None,
            tree_pending: false,
        }))
    }
}

struct SimulatedConnection {
    address: SourceAddress,
    content: Bytes,
    behavior: SourceBehavior,
    stats: StatsMap,
    /// Next byte to send and last byte of the current body
    body: Option<(u64, u64)>,
    tree_pending: bool,
}

impl SimulatedConnection {
    fn record(&self, update: impl FnOnce(&mut SourceStats)) {
        update(self.stats.lock().entry(self.address.clone()).or_default());
    }

    fn start_body(&mut self, range: Range) -> NegotiationOutcome {
        self.body = Some((range.low(), range.high()));
        self.record(|stats| stats.served_ranges.push(range));
        NegotiationOutcome::Connected { range }
    }
}

#[async_trait]
impl SourceConnection for SimulatedConnection {
    async fn request_hash_tree(&mut self) -> Result<bool, TransportError> {
        tokio::time::sleep(self.behavior.latency).await;
        self.record(|stats| stats.tree_requests += 1);
        self.tree_pending = self.behavior.hash_tree.is_some();
        Ok(self.tree_pending)
    }

    async fn read_hash_tree(&mut self) -> Result<Arc<dyn HashTree>, TransportError> {
        if !std::mem::take(&mut self.tree_pending) {
            return Err(TransportError::Io {
                reason: "no hash tree body pending".to_string(),
            });
        }
        self.behavior.hash_tree.clone().ok_or(TransportError::Closed)
    }

    async fn consume_body(&mut self) -> Result<(), TransportError> {
        self.body = None;
        self.tree_pending = false;
        Ok(())
    }

    async fn negotiate_range(
        &mut self,
        range: Range,
        supports_queueing: bool,
    ) -> Result<NegotiationOutcome, TransportError> {
        tokio::time::sleep(self.behavior.latency).await;
        self.record(|stats| stats.requests += 1);

        let outcome = match self.behavior.kind.clone() {
            SourceKind::Serve | SourceKind::Corrupt => self.start_body(range),
            SourceKind::Busy { retry_after } => NegotiationOutcome::Busy { retry_after },
            SourceKind::Queued {
                position,
                poll_interval,
                polls,
            } => {
                let seen = self
                    .stats
                    .lock()
                    .get(&self.address)
                    .map_or(0, |stats| stats.queue_polls);
                if seen >= polls {
                    self.start_body(range)
                } else if supports_queueing {
                    self.record(|stats| stats.queue_polls += 1);
                    NegotiationOutcome::Queued {
                        position,
                        poll_interval,
                    }
                } else {
                    NegotiationOutcome::NoMoreDownloaders
                }
            }
            SourceKind::Partial { available } => {
                let served = available
                    .overlapping(&range)
                    .first()
                    .and_then(|piece| piece.intersection(&range));
                match served {
                    Some(served) => self.start_body(served),
                    None => NegotiationOutcome::RangeUnavailable {
                        available: Some(available),
                    },
                }
            }
            SourceKind::NotFound => NegotiationOutcome::NotFound,
            SourceKind::ContentMismatch => NegotiationOutcome::ContentMismatch,
            SourceKind::Unreachable => return Err(TransportError::Closed),
        };
        tracing::trace!("negotiate_range: {} answered {range} with {outcome:?}", self.address);
        Ok(outcome)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        let Some((next, last)) = self.body else {
            return Ok(None);
        };
        if next > last {
            self.body = None;
            return Ok(None);
        }

        let end = (next + self.behavior.chunk_size as u64).min(last + 1);
        let len = end - next;
        if let Some(speed) = self.behavior.bytes_per_sec {
            tokio::time::sleep(Duration::from_secs_f64(len as f64 / speed as f64)).await;
        }
        self.body = Some((end, last));
        self.record(|stats| stats.bytes_served += len);

        let slice = self.content.slice(next as usize..end as usize);
        if matches!(self.behavior.kind, SourceKind::Corrupt) {
            let mut altered = BytesMut::from(&slice[..]);
            altered.iter_mut().for_each(|byte| *byte ^= CORRUPTION_MASK);
            return Ok(Some(altered.freeze()));
        }
        Ok(Some(slice))
    }

    fn available_ranges(&self) -> Option<RangeSet> {
        match &self.behavior.kind {
            SourceKind::Partial { available } => Some(available.clone()),
            _ => None,
        }
    }

    fn alt_locations(&self) -> Vec<SourceDescriptor> {
        self.behavior.alt_locations.clone()
    }

    fn is_keep_alive(&self) -> bool {
        self.behavior.keep_alive
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn address(port: u16) -> SourceAddress {
        SourceAddress::Direct(SocketAddr::from(([10, 1, 0, 1], port)))
    }

    fn descriptor(address: SourceAddress) -> SourceDescriptor {
        SourceDescriptor {
            address,
            ..SourceDescriptor::direct(SocketAddr::from(([0, 0, 0, 0], 0)), "f", 100)
        }
    }

    fn direct_target(address: &SourceAddress) -> ConnectTarget {
        match address {
            SourceAddress::Direct(addr) => ConnectTarget::Direct(*addr),
            other => panic!("not direct: {other}"),
        }
    }

    fn r(low: u64, high: u64) -> Range {
        Range::new(low, high).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_source_serves_only_what_it_holds() {
        let content = Bytes::from(vec![1u8; 100]);
        let available = RangeSet::from_range(r(40, 59));
        let transport = SimulatedTransport::new(content)
            .with_source(address(1), SourceBehavior::partial(available.clone()));
        let source = descriptor(address(1));

        let mut conn = transport
            .connect(&source, &direct_target(&source.address), Duration::from_secs(1))
            .await
            .unwrap();

        let outcome = conn.negotiate_range(r(0, 29), false).await.unwrap();
        assert_eq!(
            outcome,
            NegotiationOutcome::RangeUnavailable {
                available: Some(available)
            }
        );
        let outcome = conn.negotiate_range(r(50, 99), false).await.unwrap();
        assert_eq!(outcome, NegotiationOutcome::Connected { range: r(50, 59) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_source_alters_bytes() {
        let content = Bytes::from(vec![0u8; 64]);
        let transport = SimulatedTransport::new(content)
            .with_source(address(2), SourceBehavior::corrupt());
        let source = descriptor(address(2));

        let mut conn = transport
            .connect(&source, &direct_target(&source.address), Duration::from_secs(1))
            .await
            .unwrap();
        conn.negotiate_range(r(0, 63), false).await.unwrap();
        let chunk = conn.next_chunk().await.unwrap().unwrap();

        assert!(chunk.iter().all(|byte| *byte == CORRUPTION_MASK));
        assert_eq!(conn.next_chunk().await.unwrap(), None);
        assert_eq!(transport.stats(&address(2)).bytes_served, 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_then_serve() {
        let content = Bytes::from(vec![0u8; 10]);
        let transport = SimulatedTransport::new(content).with_source(
            address(3),
            SourceBehavior::queued(4, Duration::from_secs(30), 1),
        );
        let source = descriptor(address(3));
        let mut conn = transport
            .connect(&source, &direct_target(&source.address), Duration::from_secs(1))
            .await
            .unwrap();

        let first = conn.negotiate_range(r(0, 9), true).await.unwrap();
        assert!(matches!(first, NegotiationOutcome::Queued { position: 4, .. }));
        let second = conn.negotiate_range(r(0, 9), true).await.unwrap();
        assert_eq!(second, NegotiationOutcome::Connected { range: r(0, 9) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_firewalled_source_refuses_direct() {
        let transport = SimulatedTransport::new(Bytes::from(vec![0u8; 10]))
            .with_source(address(4), SourceBehavior::serving().firewalled());
        let source = descriptor(address(4));

        let result = transport
            .connect(&source, &direct_target(&source.address), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{LegacyRanker, SourceRanker, min_wait_time};
use crate::config::RankerConfig;
use crate::mesh::Mesh;
use crate::range::RangeSet;
use crate::source::{RemoteSourceContext, SourceAddress, SourceDescriptor};

/// Lightweight liveness probe for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub source: SourceAddress,
    /// Hosts the probe is actually sent to: the source itself, or its push proxies
    pub via: Vec<SocketAddr>,
}

/// Answer to a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReply {
    pub source: SourceAddress,
    pub has_file: bool,
    pub busy: bool,
    /// Negative for free upload slots, positive for a queue position
    pub queue_status: i32,
    /// Ranges held by a partial source
    pub available_ranges: Option<RangeSet>,
    pub alt_locations: Vec<SourceDescriptor>,
}

pub type ProbeReplySender = mpsc::UnboundedSender<ProbeReply>;

/// Sends out-of-band probes; answers arrive later on `replies`.
pub trait Prober: Send + Sync {
    fn send_probe(&self, request: ProbeRequest, replies: ProbeReplySender);
}

/// Ranker that probes new hosts and serves responsive ones first.
///
/// Sources move through tiers: new (never probed), pinged (probe in
/// flight), tested (probed, no usable answer yet) and verified (answered
/// that they have the file). The verified tier is ordered by
/// (complete before partial, queue status, round-trip time). Probing
/// stops once enough hosts are verified.
pub struct PingRanker {
    config: RankerConfig,
    prober: Arc<dyn Prober>,
    mesh: Arc<dyn Mesh>,
    new_hosts: Vec<RemoteSourceContext>,
    pinged: HashMap<SourceAddress, (RemoteSourceContext, Instant)>,
    tested: Vec<RemoteSourceContext>,
    verified: Vec<RemoteSourceContext>,
    last_ping: Option<Instant>,
    replies_tx: ProbeReplySender,
    replies_rx: mpsc::UnboundedReceiver<ProbeReply>,
    stopped: bool,
}

impl PingRanker {
    pub fn new(config: RankerConfig, prober: Arc<dyn Prober>, mesh: Arc<dyn Mesh>) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            config,
            prober,
            mesh,
            new_hosts: Vec::new(),
            pinged: HashMap::new(),
            tested: Vec::new(),
            verified: Vec::new(),
            last_ping: None,
            replies_tx,
            replies_rx,
            stopped: false,
        }
    }

    fn knows_about_host(&self, address: &SourceAddress) -> bool {
        self.pinged.contains_key(address)
            || self
                .new_hosts
                .iter()
                .chain(&self.tested)
                .chain(&self.verified)
                .any(|s| s.address() == address)
    }

    fn all_sources(&self) -> impl Iterator<Item = &RemoteSourceContext> {
        self.new_hosts
            .iter()
            .chain(self.pinged.values().map(|(source, _)| source))
            .chain(&self.tested)
            .chain(&self.verified)
    }

    fn is_cancelled(&self) -> bool {
        self.stopped || self.verified.len() >= self.config.max_verified_hosts
    }

    /// Drains every probe answer received so far.
    fn drain_replies(&mut self) {
        while let Ok(reply) = self.replies_rx.try_recv() {
            self.process_probe_reply(reply);
        }
    }

    /// Applies one probe answer to the tiers.
    pub fn process_probe_reply(&mut self, reply: ProbeReply) {
        let Some((source, sent_at)) = self.pinged.remove(&reply.source).or_else(|| {
            let index = self.tested.iter().position(|s| *s.address() == reply.source)?;
            Some((self.tested.remove(index), Instant::now()))
        }) else {
            tracing::trace!("process_probe_reply: unsolicited reply from {}", reply.source);
            return;
        };
        source.set_rtt(sent_at.elapsed());

        if !reply.has_file {
            tracing::debug!("process_probe_reply: {source} does not have the file");
            self.mesh.inform_mesh(source.descriptor(), false);
            return;
        }

        if reply.busy && !source.is_busy() {
            source.set_retry_after(Duration::from_secs(60));
        }
        source.set_queue_status(reply.queue_status);
        match reply.available_ranges {
            Some(ranges) => source.set_available_ranges(ranges),
            None => source.clear_available_ranges(),
        }
        if !reply.alt_locations.is_empty() {
            self.mesh.add_possible_sources(reply.alt_locations);
        }

        if reply.busy {
            tracing::debug!("process_probe_reply: {source} is busy, back to new hosts");
            self.new_hosts.push(source);
        } else {
            tracing::debug!("process_probe_reply: {source} verified");
            self.verified.push(source);
            self.sort_verified();
        }
    }

    fn sort_verified(&mut self) {
        self.verified.sort_by_key(|source| {
            (
                source.is_partial_source(),
                source.queue_status(),
                source.rtt().unwrap_or(Duration::MAX),
            )
        });
    }

    /// Probes up to one batch of non-busy new hosts, at most once per interval.
    fn ping_new_hosts(&mut self) {
        if self.is_cancelled() || !self.has_usable_hosts() {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_ping
            && now.duration_since(last) < self.config.probe_interval
        {
            return;
        }
        self.last_ping = Some(now);

        let mut sent = 0;
        let mut index = 0;
        while index < self.new_hosts.len() && sent < self.config.probe_batch {
            if self.new_hosts[index].is_busy() {
                index += 1;
                continue;
            }
            let source = self.new_hosts.remove(index);
            let via = match source.address() {
                SourceAddress::Direct(addr) | SourceAddress::MulticastHint(addr) => vec![*addr],
                SourceAddress::Relay { proxies, .. } => proxies.clone(),
            };
            self.prober.send_probe(
                ProbeRequest {
                    source: source.address().clone(),
                    via,
                },
                self.replies_tx.clone(),
            );
            self.pinged.insert(source.address().clone(), (source, now));
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!("ping_new_hosts: probed {sent} hosts");
        }
    }
}

impl SourceRanker for PingRanker {
    fn add_to_pool(&mut self, sources: Vec<RemoteSourceContext>) -> bool {
        self.drain_replies();
        let mut sources = sources;
        // alternate-location hosts are the least trustworthy, probe them last
        sources.sort_by_key(|s| s.descriptor().capabilities.from_alt_location);

        let mut usable = false;
        for source in sources {
            if self.knows_about_host(source.address()) {
                continue;
            }
            usable |= !source.is_busy();
            if source.descriptor().capabilities.multicast_reply {
                self.verified.push(source);
            } else {
                self.new_hosts.push(source);
            }
        }
        self.sort_verified();
        self.ping_new_hosts();
        usable
    }

    fn get_best(&mut self) -> Option<RemoteSourceContext> {
        self.drain_replies();

        let best = if !self.verified.is_empty() {
            Some(self.verified.remove(0))
        } else {
            let mut candidates: Vec<RemoteSourceContext> =
                self.tested.iter().chain(&self.new_hosts).cloned().collect();
            candidates.extend(self.pinged.values().map(|(source, _)| source.clone()));
            LegacyRanker::best_index(&candidates).map(|index| {
                let chosen = candidates.swap_remove(index);
                self.tested.retain(|s| !s.same_source(&chosen));
                self.new_hosts.retain(|s| !s.same_source(&chosen));
                self.pinged.remove(chosen.address());
                chosen
            })
        };

        self.ping_new_hosts();
        if let Some(best) = &best {
            tracing::debug!("PingRanker::get_best: {best}");
        }
        best
    }

    fn has_more(&self) -> bool {
        !self.new_hosts.is_empty()
            || !self.pinged.is_empty()
            || !self.tested.is_empty()
            || !self.verified.is_empty()
    }

    fn has_usable_hosts(&self) -> bool {
        self.all_sources().any(|s| !s.is_busy())
    }

    fn calculate_wait_time(&self) -> Duration {
        min_wait_time(self.all_sources())
    }

    fn shareable_sources(&self) -> Vec<RemoteSourceContext> {
        self.verified
            .iter()
            .filter(|s| !s.address().is_relay())
            .cloned()
            .collect()
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.new_hosts.clear();
        self.pinged.clear();
        self.tested.clear();
        self.verified.clear();
    }

    fn len(&self) -> usize {
        self.new_hosts.len() + self.pinged.len() + self.tested.len() + self.verified.len()
    }

    fn tick(&mut self) {
        self.drain_replies();
        // probes that never came back are demoted so they can still be picked
        let timeout = self.config.probe_interval * 2;
        let expired: Vec<SourceAddress> = self
            .pinged
            .iter()
            .filter(|(_, (_, sent))| sent.elapsed() >= timeout)
            .map(|(address, _)| address.clone())
            .collect();
        for address in expired {
            if let Some((source, _)) = self.pinged.remove(&address) {
                self.tested.push(source);
            }
        }
        self.ping_new_hosts();
    }
}

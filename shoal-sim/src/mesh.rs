//! Mesh and prober doubles that record what the engine told them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shoal_core::mesh::Mesh;
use shoal_core::ranker::{ProbeReply, ProbeReplySender, ProbeRequest, Prober};
use shoal_core::source::{SourceAddress, SourceDescriptor};

/// Mesh that keeps every signal for later assertions.
#[derive(Debug, Default)]
pub struct RecordingMesh {
    reports: Mutex<Vec<(SourceAddress, bool)>>,
    possible: Mutex<Vec<SourceDescriptor>>,
}

impl RecordingMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `inform_mesh` call, in order.
    pub fn reports(&self) -> Vec<(SourceAddress, bool)> {
        self.reports.lock().clone()
    }

    pub fn good_sources(&self) -> Vec<SourceAddress> {
        self.filtered(true)
    }

    pub fn bad_sources(&self) -> Vec<SourceAddress> {
        self.filtered(false)
    }

    pub fn possible_sources(&self) -> Vec<SourceDescriptor> {
        self.possible.lock().clone()
    }

    fn filtered(&self, good: bool) -> Vec<SourceAddress> {
        let mut sources: Vec<_> = self
            .reports
            .lock()
            .iter()
            .filter(|(_, was_good)| *was_good == good)
            .map(|(address, _)| address.clone())
            .collect();
        sources.dedup();
        sources
    }
}

impl Mesh for RecordingMesh {
    fn inform_mesh(&self, source: &SourceDescriptor, good: bool) {
        tracing::debug!("RecordingMesh: {} good={good}", source.address);
        self.reports.lock().push((source.address.clone(), good));
    }

    fn add_possible_sources(&self, sources: Vec<SourceDescriptor>) {
        self.possible.lock().extend(sources);
    }
}

/// Prober answering from a fixed table after a round-trip delay.
///
/// Sources missing from the table never answer.
pub struct SimulatedProber {
    replies: HashMap<SourceAddress, ProbeReply>,
    rtt: Duration,
    sent: Arc<Mutex<Vec<ProbeRequest>>>,
}

impl SimulatedProber {
    pub fn new(rtt: Duration) -> Self {
        Self {
            replies: HashMap::new(),
            rtt,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_reply(mut self, reply: ProbeReply) -> Self {
        self.replies.insert(reply.source.clone(), reply);
        self
    }

    /// Reply saying `source` holds the whole file and has a free slot.
    pub fn has_file(source: SourceAddress) -> ProbeReply {
        ProbeReply {
            source,
            has_file: true,
            busy: false,
            queue_status: -1,
            available_ranges: None,
            alt_locations: Vec::new(),
        }
    }

    pub fn probes_sent(&self) -> Vec<ProbeRequest> {
        self.sent.lock().clone()
    }
}

impl Prober for SimulatedProber {
    fn send_probe(&self, request: ProbeRequest, replies: ProbeReplySender) {
        let reply = self.replies.get(&request.source).cloned();
        self.sent.lock().push(request);
        let Some(reply) = reply else {
            return;
        };
        let rtt = self.rtt;
        tokio::spawn(async move {
            tokio::time::sleep(rtt).await;
            let _ = replies.send(reply);
        });
    }
}

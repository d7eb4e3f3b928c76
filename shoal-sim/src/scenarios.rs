//! Swarm download scenarios over simulated collaborators.
//!
//! A scenario derives the file contents, the hash tree and the selection
//! randomness from one seed, spawns a real download against scripted
//! sources and reports how it ended. Run it under a paused tokio clock for
//! instant, repeatable results.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, ensure};
use serde::Serialize;
use shoal_core::config::ShoalConfig;
use shoal_core::coordinator::{DownloadServices, DownloadState, DownloadStatus, spawn_download};
use shoal_core::hash_tree::HashTree;
use shoal_core::persistence::{JsonSnapshotStore, NoPersistence, PersistenceSink};
use shoal_core::source::{
    ContentHash, DownloadIdentity, SourceAddress, SourceCapabilities, SourceDescriptor,
};
use tokio::time::Instant;

use crate::deterministic::DeterministicRng;
use crate::disk::MemoryDisk;
use crate::hash_tree::Sha1ChunkTree;
use crate::mesh::RecordingMesh;
use crate::transport::{SimulatedTransport, SourceBehavior};

/// Name every simulated source advertises.
pub const SCENARIO_FILE_NAME: &str = "shoal-simulated.bin";

/// Port of simulated source `index`; hosts are 10.0.x.y.
pub fn source_address(index: usize) -> SocketAddr {
    let host = (index % 250 + 1) as u8;
    let subnet = (index / 250) as u8;
    SocketAddr::from(([10, 0, subnet, host], 6346))
}

/// Builder for one simulated swarm download.
#[derive(Debug, Clone)]
pub struct SwarmScenario {
    seed: u64,
    file_size: u64,
    sources: Vec<SourceBehavior>,
    config: ShoalConfig,
    tree_node_size: Option<u64>,
    snapshot_path: Option<PathBuf>,
    time_limit: Duration,
}

impl SwarmScenario {
    pub fn new(seed: u64, file_size: u64) -> Self {
        let mut config = ShoalConfig::for_testing();
        config.simulation.deterministic_seed = Some(seed);
        Self {
            seed,
            file_size,
            sources: Vec::new(),
            config,
            tree_node_size: None,
            snapshot_path: None,
            time_limit: Duration::from_secs(3600),
        }
    }

    /// `count` fast sources serving the whole file.
    pub fn healthy(seed: u64, file_size: u64, count: usize) -> Self {
        Self::new(seed, file_size).sources(count, SourceBehavior::serving())
    }

    pub fn source(mut self, behavior: SourceBehavior) -> Self {
        self.sources.push(behavior);
        self
    }

    pub fn sources(mut self, count: usize, behavior: SourceBehavior) -> Self {
        self.sources.extend(std::iter::repeat_n(behavior, count));
        self
    }

    /// Pins the worker ceiling instead of deriving it from bandwidth.
    pub fn swarm_capacity(mut self, capacity: usize) -> Self {
        self.config.swarm.fixed_capacity = Some(capacity);
        self
    }

    /// Serves a SHA-1 chunk tree of `node_size` from every source.
    pub fn with_hash_tree(mut self, node_size: u64) -> Self {
        self.tree_node_size = Some(node_size);
        self
    }

    pub fn with_config(mut self, adjust: impl FnOnce(&mut ShoalConfig)) -> Self {
        adjust(&mut self.config);
        self
    }

    pub fn snapshot_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Longest (virtual) time to wait for the download to settle.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs the download until it settles or the time limit passes.
    ///
    /// Settled means a terminal state or GAVE_UP. A download still running
    /// at the limit is stopped and reported with the state it had.
    ///
    /// # Errors
    ///
    /// - `anyhow::Error` - If the configuration is invalid or the download actor died
    pub async fn run(self) -> anyhow::Result<ScenarioReport> {
        self.config
            .validate()
            .context("invalid scenario configuration")?;
        ensure!(
            self.tree_node_size != Some(0),
            "hash tree node size must be positive"
        );

        let mut rng = DeterministicRng::from_seed(self.seed);
        let content = rng.content(self.file_size as usize);
        let content_hash = ContentHash::of(&content);
        let tree: Option<Arc<dyn HashTree>> = self
            .tree_node_size
            .map(|node_size| Arc::new(Sha1ChunkTree::build(&content, node_size)) as Arc<dyn HashTree>);

        let mut transport = SimulatedTransport::new(content.clone());
        let mut descriptors = Vec::with_capacity(self.sources.len());
        let mut labels = Vec::with_capacity(self.sources.len());
        for (index, mut behavior) in self.sources.into_iter().enumerate() {
            if let Some(tree) = &tree
                && behavior.hash_tree.is_none()
            {
                behavior = behavior.with_hash_tree(tree.clone());
            }
            let capabilities = SourceCapabilities {
                supports_queueing: behavior.supports_queueing(),
                serves_hash_tree: behavior.hash_tree.is_some(),
                keep_alive: behavior.keep_alive,
                ..SourceCapabilities::default()
            };
            let address = source_address(index);
            descriptors.push(
                SourceDescriptor::direct(address, SCENARIO_FILE_NAME, self.file_size)
                    .with_hash(content_hash)
                    .with_capabilities(capabilities),
            );
            labels.push((SourceAddress::Direct(address), behavior.kind.label()));
            transport.add_source(SourceAddress::Direct(address), behavior);
        }

        let transport = Arc::new(transport);
        let disk = Arc::new(MemoryDisk::new());
        let mesh = Arc::new(RecordingMesh::new());
        let persistence: Arc<dyn PersistenceSink> = match &self.snapshot_path {
            Some(path) => Arc::new(JsonSnapshotStore::new(path)),
            None => Arc::new(NoPersistence),
        };
        let services = DownloadServices {
            mesh: mesh.clone(),
            persistence,
            expected_root: tree.as_ref().map(|tree| tree.root().to_string()),
            selection_rng: Some(rng.fork()),
            ..DownloadServices::default()
        };
        let identity = DownloadIdentity {
            file_name: SCENARIO_FILE_NAME.to_string(),
            file_size: self.file_size,
            content_hash: Some(content_hash),
        };

        tracing::info!(
            "Scenario seed={} size={} sources={}",
            self.seed,
            self.file_size,
            descriptors.len()
        );
        let started = Instant::now();
        let handle = spawn_download(self.config, identity, disk.clone(), transport.clone(), services);
        if !descriptors.is_empty() {
            handle
                .add_sources(descriptors)
                .await
                .context("offering sources")?;
        }

        let mut states = handle.subscribe();
        let settled = tokio::time::timeout(
            self.time_limit,
            states.wait_for(|state| state.is_terminal() || *state == DownloadState::GaveUp),
        )
        .await
        .map(|result| result.map(|state| *state));
        let final_state = match settled {
            Ok(Ok(state)) => state,
            _ => handle.state(),
        };
        let elapsed = started.elapsed();

        let status = handle.status().await.context("reading final status")?;
        if !final_state.is_terminal() {
            handle.stop().await.context("stopping download")?;
            handle.wait_for_terminal().await;
        }

        let sources = labels
            .into_iter()
            .map(|(address, behavior)| {
                let stats = transport.stats(&address);
                SourceReport {
                    address: address.to_string(),
                    behavior,
                    connects: stats.connects,
                    requests: stats.requests,
                    bytes_served: stats.bytes_served,
                }
            })
            .collect();

        Ok(ScenarioReport {
            seed: self.seed,
            file_size: self.file_size,
            final_state,
            content_matches: disk.contents().is_some_and(|data| data[..] == content[..]),
            elapsed_ms: elapsed.as_millis() as u64,
            status,
            sources,
            mesh_good: mesh.good_sources().iter().map(ToString::to_string).collect(),
            mesh_bad: mesh.bad_sources().iter().map(ToString::to_string).collect(),
        })
    }
}

/// Per-source summary of a scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub address: String,
    pub behavior: &'static str,
    pub connects: u32,
    pub requests: u32,
    pub bytes_served: u64,
}

/// How a scenario ended.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub seed: u64,
    pub file_size: u64,
    pub final_state: DownloadState,
    /// The file on the simulated disk equals the served content
    pub content_matches: bool,
    /// Virtual time from spawn to settle
    pub elapsed_ms: u64,
    pub status: DownloadStatus,
    pub sources: Vec<SourceReport>,
    pub mesh_good: Vec<String>,
    pub mesh_bad: Vec<String>,
}

impl ScenarioReport {
    pub fn is_success(&self) -> bool {
        self.final_state == DownloadState::Complete && self.content_matches
    }

    pub fn source(&self, index: usize) -> Option<&SourceReport> {
        self.sources.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_addresses_are_distinct() {
        let addresses: std::collections::HashSet<_> = (0..600).map(source_address).collect();
        assert_eq!(addresses.len(), 600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_swarm_completes() {
        let report = SwarmScenario::healthy(1, 500_000, 3).run().await.unwrap();

        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.status.lost_bytes, 0);
        let served: u64 = report.sources.iter().map(|s| s.bytes_served).sum();
        assert!(served >= 500_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_tree_size_rejected() {
        let result = SwarmScenario::healthy(1, 1000, 1).with_hash_tree(0).run().await;
        assert!(result.is_err());
    }
}

//! Source pool ranking.
//!
//! A ranker holds every candidate source of one download that is not
//! currently in use by a worker and hands out the most promising one on
//! request. Two policies exist: a static legacy ordering, and a ranker that
//! probes new hosts out of band and serves hosts that answered positively
//! before anything untested.

mod legacy;
mod ping;

use std::sync::Arc;
use std::time::Duration;

pub use legacy::LegacyRanker;
pub use ping::{PingRanker, ProbeReply, ProbeReplySender, ProbeRequest, Prober};

use crate::config::RankerConfig;
use crate::mesh::Mesh;
use crate::source::RemoteSourceContext;

/// Pool of candidate sources with a ranking policy.
pub trait SourceRanker: Send {
    /// Merges new sources, skipping ones already known by address.
    ///
    /// Returns true if any newly added source is usable right now.
    fn add_to_pool(&mut self, sources: Vec<RemoteSourceContext>) -> bool;

    /// Removes and returns the best candidate, busy or not.
    fn get_best(&mut self) -> Option<RemoteSourceContext>;

    fn has_more(&self) -> bool;

    /// True if at least one pooled source is not backed off.
    fn has_usable_hosts(&self) -> bool;

    /// Shortest time until a backed-off source becomes eligible; zero when
    /// a usable host exists or the pool is empty.
    fn calculate_wait_time(&self) -> Duration;

    /// Sources worth advertising to other hosts as alternate locations.
    fn shareable_sources(&self) -> Vec<RemoteSourceContext>;

    /// Drops every pooled source and stops any background activity.
    fn stop(&mut self);

    /// Number of pooled sources.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gives the ranker a chance to run periodic work such as probing.
    fn tick(&mut self) {}
}

/// Builds the ranker for a download: probing when a prober is available.
pub fn ranker_for(
    config: &RankerConfig,
    prober: Option<Arc<dyn Prober>>,
    mesh: Arc<dyn Mesh>,
) -> Box<dyn SourceRanker> {
    match prober {
        Some(prober) => Box::new(PingRanker::new(config.clone(), prober, mesh)),
        None => Box::new(LegacyRanker::new()),
    }
}

/// Minimum wait across `sources`, zero if any is usable.
pub(crate) fn min_wait_time<'a>(sources: impl Iterator<Item = &'a RemoteSourceContext>) -> Duration {
    let mut shortest: Option<Duration> = None;
    for source in sources {
        let wait = source.wait_time();
        if wait.is_zero() {
            return Duration::ZERO;
        }
        shortest = Some(shortest.map_or(wait, |s| s.min(wait)));
    }
    shortest.unwrap_or(Duration::ZERO)
}

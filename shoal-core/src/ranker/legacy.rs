use std::cmp::Reverse;
use std::time::Duration;

use super::{SourceRanker, min_wait_time};
use crate::source::RemoteSourceContext;

/// Static ranking by metadata.
///
/// Order: usable before backed off, direct before relayed, then quality,
/// advertised speed, and fewest failures.
#[derive(Debug, Default)]
pub struct LegacyRanker {
    sources: Vec<RemoteSourceContext>,
}

impl LegacyRanker {
    pub fn new() -> Self {
        Self::default()
    }

    fn knows_about(&self, source: &RemoteSourceContext) -> bool {
        self.sources.iter().any(|s| s.address() == source.address())
    }

    /// Index of the best source by the legacy ordering.
    pub(super) fn best_index(sources: &[RemoteSourceContext]) -> Option<usize> {
        sources
            .iter()
            .enumerate()
            .min_by_key(|(_, source)| {
                let capabilities = &source.descriptor().capabilities;
                (
                    source.is_busy(),
                    source.address().is_relay(),
                    Reverse(capabilities.quality),
                    Reverse(capabilities.speed_kbps),
                    source.failure_count(),
                )
            })
            .map(|(index, _)| index)
    }
}

impl SourceRanker for LegacyRanker {
    fn add_to_pool(&mut self, sources: Vec<RemoteSourceContext>) -> bool {
        let mut usable = false;
        for source in sources {
            if self.knows_about(&source) {
                continue;
            }
            usable |= !source.is_busy();
            self.sources.push(source);
        }
        usable
    }

    fn get_best(&mut self) -> Option<RemoteSourceContext> {
        let index = Self::best_index(&self.sources)?;
        let best = self.sources.swap_remove(index);
        tracing::debug!("LegacyRanker::get_best: {best}");
        Some(best)
    }

    fn has_more(&self) -> bool {
        !self.sources.is_empty()
    }

    fn has_usable_hosts(&self) -> bool {
        self.sources.iter().any(|s| !s.is_busy())
    }

    fn calculate_wait_time(&self) -> Duration {
        min_wait_time(self.sources.iter())
    }

    fn shareable_sources(&self) -> Vec<RemoteSourceContext> {
        self.sources
            .iter()
            .filter(|s| !s.address().is_relay())
            .cloned()
            .collect()
    }

    fn stop(&mut self) {
        self.sources.clear();
    }

    fn len(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use uuid::Uuid;

    use super::*;
    use crate::source::{SourceAddress, SourceCapabilities, SourceDescriptor};

    fn direct(port: u16, quality: u8) -> RemoteSourceContext {
        let addr = SocketAddr::from(([10, 0, 0, 1], port));
        RemoteSourceContext::new(SourceDescriptor::direct(addr, "f", 100).with_capabilities(
            SourceCapabilities {
                quality,
                ..Default::default()
            },
        ))
    }

    fn relay(quality: u8) -> RemoteSourceContext {
        let mut descriptor = SourceDescriptor::direct(SocketAddr::from(([0, 0, 0, 0], 0)), "f", 100);
        descriptor.address = SourceAddress::Relay {
            client_id: Uuid::new_v4(),
            proxies: vec![SocketAddr::from(([10, 0, 0, 9], 1))],
        };
        descriptor.capabilities.quality = quality;
        RemoteSourceContext::new(descriptor)
    }

    #[test]
    fn test_empty_pool_yields_nothing() {
        let mut ranker = LegacyRanker::new();
        assert!(ranker.get_best().is_none());
        assert!(!ranker.has_more());
        assert_eq!(ranker.calculate_wait_time(), Duration::ZERO);
    }

    #[test]
    fn test_duplicates_ignored() {
        let mut ranker = LegacyRanker::new();
        assert!(ranker.add_to_pool(vec![direct(1, 1)]));
        assert!(!ranker.add_to_pool(vec![direct(1, 3)]));
        assert_eq!(ranker.len(), 1);
    }

    #[test]
    fn test_ordering_prefers_usable_direct_quality() {
        let mut ranker = LegacyRanker::new();
        let busy = direct(1, 5);
        busy.set_retry_after(Duration::from_secs(60));
        ranker.add_to_pool(vec![busy, relay(4), direct(2, 1), direct(3, 3)]);

        assert_eq!(ranker.get_best().unwrap().descriptor().capabilities.quality, 3);
        assert_eq!(ranker.get_best().unwrap().descriptor().capabilities.quality, 1);
        assert!(ranker.get_best().unwrap().address().is_relay());
        let last = ranker.get_best().unwrap();
        assert!(last.is_busy());
        assert!(ranker.get_best().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_is_minimum_backoff() {
        let mut ranker = LegacyRanker::new();
        let a = direct(1, 1);
        let b = direct(2, 1);
        a.set_retry_after(Duration::from_secs(120));
        b.set_retry_after(Duration::from_secs(300));
        assert!(!ranker.add_to_pool(vec![a, b]));

        assert!(!ranker.has_usable_hosts());
        assert_eq!(ranker.calculate_wait_time(), Duration::from_secs(120));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(ranker.has_usable_hosts());
        assert_eq!(ranker.calculate_wait_time(), Duration::ZERO);
    }
}

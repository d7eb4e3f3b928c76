use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

use super::random::interval_above;
use super::{FixedIdle, RandomStrategy, SelectionError, SelectionStrategy};
use crate::config::SelectionConfig;
use crate::range::{Range, RangeSet};

/// Source of "how long has the local user been idle".
///
/// An idle user is not waiting on a preview, so selection falls back to
/// fully random picks.
pub trait IdleTimeSource: Send + Sync {
    fn idle_time(&self) -> Duration;
}

/// Random selection biased toward the start of the file.
///
/// While the contiguous downloaded prefix is small the first candidate is
/// always chosen so the file becomes previewable early. The bias halves once
/// the prefix passes the full-bias threshold and disappears past the half-bias
/// threshold.
pub struct BiasedRandomStrategy {
    random: RandomStrategy,
    config: SelectionConfig,
    idle: Arc<dyn IdleTimeSource>,
}

impl BiasedRandomStrategy {
    pub fn new(rng: Box<dyn RngCore + Send>, file_size: u64, config: SelectionConfig) -> Self {
        Self {
            random: RandomStrategy::new(rng, file_size),
            config,
            idle: Arc::new(FixedIdle::default()),
        }
    }

    /// Replaces the idle time source.
    pub fn with_idle_source(mut self, idle: Arc<dyn IdleTimeSource>) -> Self {
        self.idle = idle;
        self
    }

    /// Probability of taking the first candidate given the previewable prefix.
    pub fn bias(&self, previewable_bytes: u64) -> f64 {
        let file_size = self.random.file_size() as f64;
        let full_bias_limit = (self.config.preview_min_bytes as f64)
            .max(file_size * self.config.full_bias_fraction);
        let half_bias_limit = file_size * self.config.half_bias_fraction;

        let previewable = previewable_bytes as f64;
        if previewable < full_bias_limit {
            1.0
        } else if previewable < half_bias_limit {
            0.5
        } else {
            0.0
        }
    }
}

impl SelectionStrategy for BiasedRandomStrategy {
    fn pick_assignment(
        &mut self,
        candidates: &RangeSet,
        needed: &RangeSet,
        block_size: u64,
    ) -> Result<Range, SelectionError> {
        if self.idle.idle_time() > self.config.idle_threshold {
            return self.random.pick_assignment(candidates, needed, block_size);
        }

        self.random.validate(needed, block_size)?;
        let first = candidates
            .first()
            .map_err(|_| SelectionError::NoCandidates)?;

        let previewable = needed.first().map(|r| r.low()).unwrap_or(0);
        let bias = self.bias(previewable);
        if bias > 0.0 && self.random.chance(bias) {
            let picked = interval_above(first, first.low(), block_size);
            tracing::trace!("pick_assignment: preview bias {bias} picked {picked}");
            return Ok(picked);
        }

        self.random.pick_assignment(candidates, needed, block_size)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn strategy(file_size: u64) -> BiasedRandomStrategy {
        BiasedRandomStrategy::new(
            Box::new(StdRng::seed_from_u64(3)),
            file_size,
            SelectionConfig::default(),
        )
    }

    #[test]
    fn test_bias_thresholds() {
        let small = strategy(4 * MIB);
        assert_eq!(small.bias(0), 1.0);
        assert_eq!(small.bias(MIB - 1), 1.0);
        assert_eq!(small.bias(MIB), 0.5);
        assert_eq!(small.bias(2 * MIB), 0.0);

        let large = strategy(100 * MIB);
        assert_eq!(large.bias(5 * MIB), 1.0);
        assert_eq!(large.bias(10 * MIB), 0.5);
        assert_eq!(large.bias(49 * MIB), 0.5);
        assert_eq!(large.bias(50 * MIB), 0.0);
    }

    #[test]
    fn test_fresh_download_takes_file_start() {
        let file_size = 10 * MIB;
        let needed = RangeSet::full(file_size);

        for seed in 0..20 {
            let mut picker = BiasedRandomStrategy::new(
                Box::new(StdRng::seed_from_u64(seed)),
                file_size,
                SelectionConfig::default(),
            );
            let picked = picker.pick_assignment(&needed, &needed, 131_072).unwrap();
            assert_eq!(picked, Range::new(0, 131_071).unwrap());
        }
    }

    #[test]
    fn test_idle_user_gets_random_picks() {
        let file_size = 100 * MIB;
        let needed = RangeSet::full(file_size);
        let mut saw_non_start = false;

        for seed in 0..20 {
            let mut picker = BiasedRandomStrategy::new(
                Box::new(StdRng::seed_from_u64(seed)),
                file_size,
                SelectionConfig::default(),
            )
            .with_idle_source(Arc::new(FixedIdle(Duration::from_secs(301))));
            let picked = picker.pick_assignment(&needed, &needed, 131_072).unwrap();
            if picked.low() != 0 {
                saw_non_start = true;
            }
        }
        assert!(saw_non_start);
    }
}

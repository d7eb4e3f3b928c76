//! Range selection strategies for white-range leasing.
//!
//! A strategy picks which sub-range of the still-needed bytes a worker should
//! lease next. Strategies own an injected random source so that simulations
//! can replay identical assignment sequences from a seed.

mod biased;
mod random;

use std::time::Duration;

use rand::RngCore;

pub use biased::{BiasedRandomStrategy, IdleTimeSource};
pub use random::{MAX_FRAGMENTS, RandomStrategy};

use crate::config::{SelectionConfig, SelectionKind};
use crate::range::{Range, RangeSet};

/// Errors produced while picking an assignment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("No candidate ranges to pick from")]
    NoCandidates,

    #[error("Invalid selection argument: {reason}")]
    InvalidArgument { reason: String },
}

/// Trait for range selection policies.
///
/// Callers guarantee `candidates` is a subset of `needed`.
pub trait SelectionStrategy: Send {
    /// Chooses the next range to assign from `candidates`.
    ///
    /// # Errors
    ///
    /// - `SelectionError::NoCandidates` - If `candidates` is empty
    /// - `SelectionError::InvalidArgument` - If `block_size` is zero or `needed` exceeds the file
    fn pick_assignment(
        &mut self,
        candidates: &RangeSet,
        needed: &RangeSet,
        block_size: u64,
    ) -> Result<Range, SelectionError>;
}

/// Builds the configured strategy for a file of `file_size` bytes.
pub fn strategy_for(
    config: &SelectionConfig,
    rng: Box<dyn RngCore + Send>,
    file_size: u64,
) -> Box<dyn SelectionStrategy> {
    match config.strategy {
        SelectionKind::Random => Box::new(RandomStrategy::new(rng, file_size)),
        SelectionKind::BiasedRandom => {
            Box::new(BiasedRandomStrategy::new(rng, file_size, config.clone()))
        }
    }
}

/// Last byte of the block containing `offset`.
pub(crate) fn align_high(offset: u64, block_size: u64) -> u64 {
    let next = offset.saturating_add(block_size);
    next - next % block_size - 1
}

/// First byte of the block containing `offset`.
pub(crate) fn align_low(offset: u64, block_size: u64) -> u64 {
    offset - offset % block_size
}

/// Idle source reporting a fixed duration, useful for tests and headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedIdle(pub Duration);

impl IdleTimeSource for FixedIdle {
    fn idle_time(&self) -> Duration {
        self.0
    }
}

use rand::{Rng, RngCore};

use super::{SelectionError, SelectionStrategy, align_high, align_low};
use crate::range::{Range, RangeSet};

/// Fragment count at which picks snap to existing fragment boundaries.
pub const MAX_FRAGMENTS: usize = 16;

/// Uniformly random block-aligned selection.
///
/// Picks a random "ideal" offset and returns the candidate sub-range just
/// below or just above it. Once the needed bytes are split into many
/// fragments, the ideal offset snaps to a fragment boundary so that new
/// leases grow existing holes instead of punching more.
pub struct RandomStrategy {
    rng: Box<dyn RngCore + Send>,
    file_size: u64,
}

impl RandomStrategy {
    pub fn new(rng: Box<dyn RngCore + Send>, file_size: u64) -> Self {
        Self { rng, file_size }
    }

    /// Returns true with the given probability.
    pub(super) fn chance(&mut self, probability: f64) -> bool {
        self.rng.random_bool(probability.clamp(0.0, 1.0))
    }

    pub(super) fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(super) fn validate(&self, needed: &RangeSet, block_size: u64) -> Result<(), SelectionError> {
        if block_size < 1 {
            return Err(SelectionError::InvalidArgument {
                reason: "block size must be at least one byte".to_string(),
            });
        }
        let last = needed.last().map_err(|_| SelectionError::InvalidArgument {
            reason: "needed ranges are empty".to_string(),
        })?;
        if last.high() >= self.file_size {
            return Err(SelectionError::InvalidArgument {
                reason: format!(
                    "needed range {last} exceeds file size {}",
                    self.file_size
                ),
            });
        }
        Ok(())
    }

    fn ideal_location(&mut self, needed: &RangeSet, block_size: u64) -> Result<u64, SelectionError> {
        let first = needed.first().map_err(|_| SelectionError::NoCandidates)?;
        let last = needed.last().map_err(|_| SelectionError::NoCandidates)?;

        let fragments = needed.count();
        if fragments >= MAX_FRAGMENTS {
            let pick = self.rng.random_range(0..=fragments);
            return Ok(match needed.iter().nth(pick) {
                Some(fragment) => fragment.low(),
                None => last.high() + 1,
            });
        }

        let min_block = first.low() / block_size;
        let max_block = last.high() / block_size;
        if min_block >= max_block {
            return Ok(first.low());
        }
        let block = self.rng.random_range(min_block..=max_block);
        Ok((block * block_size).max(first.low()))
    }
}

impl SelectionStrategy for RandomStrategy {
    fn pick_assignment(
        &mut self,
        candidates: &RangeSet,
        needed: &RangeSet,
        block_size: u64,
    ) -> Result<Range, SelectionError> {
        self.validate(needed, block_size)?;
        if candidates.is_empty() {
            return Err(SelectionError::NoCandidates);
        }

        let ideal = self.ideal_location(needed, block_size)?;
        let mut below = None;
        let mut above = None;
        for candidate in candidates.iter() {
            if candidate.low() < ideal {
                below = Some(interval_below(candidate, ideal, block_size));
            }
            if candidate.high() >= ideal {
                above = Some(interval_above(candidate, ideal, block_size));
                break;
            }
        }

        let picked = match (below, above) {
            (Some(below), Some(above)) => {
                if self.chance(0.5) {
                    below
                } else {
                    above
                }
            }
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => return Err(SelectionError::NoCandidates),
        };
        tracing::trace!("pick_assignment: ideal={ideal} picked={picked} from {candidates}");
        Ok(picked)
    }
}

/// Block-aligned tail of `candidate` ending just below `location`.
fn interval_below(candidate: Range, location: u64, block_size: u64) -> Range {
    let high = candidate.high().min(location - 1);
    let low = candidate.low().max(align_low(high, block_size));
    Range::new(low, high).unwrap_or(candidate)
}

/// Block-aligned head of `candidate` starting at or above `location`.
pub(super) fn interval_above(candidate: Range, location: u64, block_size: u64) -> Range {
    let low = candidate.low().max(location);
    let high = candidate.high().min(align_high(low, block_size));
    Range::new(low, high).unwrap_or(candidate)
}

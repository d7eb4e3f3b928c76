//! Range bookkeeping checks run against a live verifying file.

use std::fmt;

use shoal_core::range::{Range, RangeSet};
use shoal_core::verifying_file::{FileRanges, VerifyingFile};

/// A broken bookkeeping rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub description: String,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invariant '{}' violated: {}", self.invariant, self.description)
    }
}

impl std::error::Error for InvariantViolation {}

/// Checks that the five sets are pairwise disjoint and lie inside the file.
///
/// # Errors
///
/// Returns the first violated rule.
pub fn check_range_sets(size: u64, ranges: &FileRanges) -> Result<(), InvariantViolation> {
    let named = [
        ("verified", &ranges.verified),
        ("partial", &ranges.partial),
        ("pending", &ranges.pending),
        ("leased", &ranges.leased),
        ("corrupt", &ranges.corrupt),
    ];

    let mut seen = RangeSet::new();
    for (name, set) in named {
        if let Ok(last) = set.last()
            && last.high() >= size
        {
            return Err(InvariantViolation {
                invariant: "Bounds",
                description: format!("{name} ends at {} in a {size} byte file", last.high()),
            });
        }
        if let Some(overlap) = first_overlap(&seen, set) {
            return Err(InvariantViolation {
                invariant: "Disjoint",
                description: format!("{name} shares {overlap} with another set"),
            });
        }
        seen.add_all(set);
    }
    Ok(())
}

/// Full check of a quiescent file, including the free-byte count.
///
/// With workers running, the free-byte count may move between the two
/// reads; use [`check_range_sets`] on a single snapshot instead.
///
/// # Errors
///
/// Returns the first violated rule.
pub fn check_file_invariants(file: &VerifyingFile) -> Result<(), InvariantViolation> {
    let size = file.size();
    let ranges = file.ranges();
    check_range_sets(size, &ranges)?;

    let claimed = ranges.verified.size()
        + ranges.partial.size()
        + ranges.pending.size()
        + ranges.leased.size()
        + ranges.corrupt.size();
    let free = file.has_free_blocks_to_assign();
    if free != size - claimed {
        return Err(InvariantViolation {
            invariant: "FreeBytes",
            description: format!("{free} free bytes reported, {} unclaimed", size - claimed),
        });
    }
    Ok(())
}

fn first_overlap(a: &RangeSet, b: &RangeSet) -> Option<Range> {
    b.iter().find_map(|range| a.overlapping(&range).first().and_then(|o| o.intersection(&range)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(low: u64, high: u64) -> Range {
        Range::new(low, high).unwrap()
    }

    #[test]
    fn test_detects_overlap_and_bounds() {
        let mut ranges = FileRanges::default();
        ranges.verified.add(r(0, 99));
        ranges.leased.add(r(100, 199));
        assert_eq!(check_range_sets(200, &ranges), Ok(()));

        ranges.partial.add(r(150, 160));
        let violation = check_range_sets(200, &ranges).unwrap_err();
        assert_eq!(violation.invariant, "Disjoint");

        let mut ranges = FileRanges::default();
        ranges.corrupt.add(r(0, 200));
        let violation = check_range_sets(200, &ranges).unwrap_err();
        assert_eq!(violation.invariant, "Bounds");
    }
}

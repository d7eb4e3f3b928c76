//! Closed byte ranges and coalescing range sets.
//!
//! All download bookkeeping is expressed in terms of `RangeSet`: which bytes
//! are leased, pending, written, verified or corrupt. Members are kept
//! disjoint and non-adjacent so the covered length is always the sum of
//! member lengths.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors from range construction and range set queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("Invalid range bounds: low {low} > high {high}")]
    InvalidBounds { low: u64, high: u64 },

    #[error("Range has zero length at offset {offset}")]
    ZeroLength { offset: u64 },

    #[error("Range set is empty")]
    Empty,
}

/// Closed interval `[low, high]` of byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    low: u64,
    high: u64,
}

impl Range {
    /// Creates range covering `low..=high`.
    ///
    /// # Errors
    ///
    /// - `RangeError::InvalidBounds` - If `low` is greater than `high`
    pub fn new(low: u64, high: u64) -> Result<Self, RangeError> {
        if low > high {
            return Err(RangeError::InvalidBounds { low, high });
        }
        Ok(Self { low, high })
    }

    /// Creates range of `len` bytes starting at `start`.
    ///
    /// # Errors
    ///
    /// - `RangeError::ZeroLength` - If `len` is zero
    pub fn from_len(start: u64, len: u64) -> Result<Self, RangeError> {
        if len == 0 {
            return Err(RangeError::ZeroLength { offset: start });
        }
        Ok(Self {
            low: start,
            high: start + (len - 1),
        })
    }

    /// Creates single-byte range.
    pub fn single(offset: u64) -> Self {
        Self {
            low: offset,
            high: offset,
        }
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.high - self.low + 1
    }

    /// Ranges always cover at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        self.low <= offset && offset <= self.high
    }

    /// Returns true if `other` lies entirely inside this range.
    pub fn contains(&self, other: &Range) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.low <= other.high && other.low <= self.high
    }

    /// Returns true if the ranges touch without overlapping.
    pub fn is_adjacent(&self, other: &Range) -> bool {
        self.high.checked_add(1) == Some(other.low) || other.high.checked_add(1) == Some(self.low)
    }

    pub fn intersection(&self, other: &Range) -> Option<Range> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Range {
            low: self.low.max(other.low),
            high: self.high.min(other.high),
        })
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.low, self.high)
    }
}

/// Ordered set of disjoint, non-adjacent ranges.
///
/// Backed by a `BTreeMap` keyed by low bound, so membership queries and
/// mutations cost O(log n + k) where k is the number of members touched.
/// Adjacent or overlapping insertions coalesce into a single member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    members: BTreeMap<u64, u64>,
    size: u64,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates set containing a single range.
    pub fn from_range(range: Range) -> Self {
        let mut set = Self::new();
        set.add(range);
        set
    }

    /// Creates set covering `[0, upper_bound)`, empty when the bound is zero.
    pub fn full(upper_bound: u64) -> Self {
        match upper_bound {
            0 => Self::new(),
            _ => Self::from_range(Range {
                low: 0,
                high: upper_bound - 1,
            }),
        }
    }

    /// Adds range, coalescing with any overlapping or adjacent members.
    pub fn add(&mut self, range: Range) {
        let mut low = range.low;
        let mut high = range.high;

        if let Some((&prev_low, &prev_high)) = self.members.range(..=low).next_back()
            && prev_high.saturating_add(1) >= low
        {
            if prev_high >= high {
                return;
            }
            self.remove_member(prev_low, prev_high);
            low = prev_low;
        }

        loop {
            let limit = high.saturating_add(1);
            let next = self
                .members
                .range(low..=limit)
                .next()
                .map(|(&l, &h)| (l, h));
            match next {
                Some((next_low, next_high)) => {
                    self.remove_member(next_low, next_high);
                    high = high.max(next_high);
                }
                None => break,
            }
        }

        self.members.insert(low, high);
        self.size += high - low + 1;
    }

    /// Adds every member of `other`.
    pub fn add_all(&mut self, other: &RangeSet) {
        for range in other.iter() {
            self.add(range);
        }
    }

    /// Removes range, splitting members that straddle its bounds.
    pub fn delete(&mut self, range: Range) {
        for (low, high) in self.overlapping_members(&range) {
            self.remove_member(low, high);
            if low < range.low {
                self.insert_member(low, range.low - 1);
            }
            if high > range.high {
                self.insert_member(range.high + 1, high);
            }
        }
    }

    /// Removes every member of `other`.
    pub fn remove_all(&mut self, other: &RangeSet) {
        for range in other.iter() {
            self.delete(range);
        }
    }

    /// Returns true if `range` is entirely covered by one member.
    pub fn contains(&self, range: &Range) -> bool {
        self.members
            .range(..=range.low)
            .next_back()
            .is_some_and(|(_, &high)| high >= range.high)
    }

    /// Returns true if any byte of `range` is covered.
    pub fn contains_any(&self, range: &Range) -> bool {
        !self.overlapping_members(range).is_empty()
    }

    /// Returns the covered portions of `range`.
    pub fn overlapping(&self, range: &Range) -> Vec<Range> {
        self.overlapping_members(range)
            .into_iter()
            .filter_map(|(low, high)| Range { low, high }.intersection(range))
            .collect()
    }

    /// Keeps only bytes also covered by `other`.
    pub fn intersect_in_place(&mut self, other: &RangeSet) {
        *self = self.intersection(other);
    }

    pub fn intersection(&self, other: &RangeSet) -> RangeSet {
        let mut result = RangeSet::new();
        for range in self.iter() {
            for piece in other.overlapping(&range) {
                result.add(piece);
            }
        }
        result
    }

    /// Complement of this set within `[0, upper_bound)`.
    pub fn invert(&self, upper_bound: u64) -> RangeSet {
        let mut result = RangeSet::new();
        if upper_bound == 0 {
            return result;
        }
        let mut cursor = 0u64;
        for range in self.iter() {
            if range.low >= upper_bound {
                break;
            }
            if range.low > cursor {
                result.insert_member(cursor, range.low - 1);
            }
            match range.high.checked_add(1) {
                Some(next) => cursor = next,
                None => return result,
            }
        }
        if cursor < upper_bound {
            result.insert_member(cursor, upper_bound - 1);
        }
        result
    }

    /// Lowest member.
    ///
    /// # Errors
    ///
    /// - `RangeError::Empty` - If the set has no members
    pub fn first(&self) -> Result<Range, RangeError> {
        self.members
            .iter()
            .next()
            .map(|(&low, &high)| Range { low, high })
            .ok_or(RangeError::Empty)
    }

    /// Highest member.
    ///
    /// # Errors
    ///
    /// - `RangeError::Empty` - If the set has no members
    pub fn last(&self) -> Result<Range, RangeError> {
        self.members
            .iter()
            .next_back()
            .map(|(&low, &high)| Range { low, high })
            .ok_or(RangeError::Empty)
    }

    /// Total number of covered bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of disjoint members.
    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.size = 0;
    }

    /// Iterates members in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range> + '_ {
        self.members
            .iter()
            .map(|(&low, &high)| Range { low, high })
    }

    pub fn to_vec(&self) -> Vec<Range> {
        self.iter().collect()
    }

    fn overlapping_members(&self, range: &Range) -> Vec<(u64, u64)> {
        let mut found = Vec::new();
        if let Some((&low, &high)) = self.members.range(..range.low).next_back()
            && high >= range.low
        {
            found.push((low, high));
        }
        found.extend(
            self.members
                .range(range.low..=range.high)
                .map(|(&low, &high)| (low, high)),
        );
        found
    }

    fn insert_member(&mut self, low: u64, high: u64) {
        self.members.insert(low, high);
        self.size += high - low + 1;
    }

    fn remove_member(&mut self, low: u64, high: u64) {
        self.members.remove(&low);
        self.size -= high - low + 1;
    }
}

impl FromIterator<Range> for RangeSet {
    fn from_iter<I: IntoIterator<Item = Range>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.add(range);
        }
        set
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{range}")?;
        }
        write!(f, "}}")
    }
}

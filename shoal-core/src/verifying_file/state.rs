//! Range bookkeeping behind the verifying file lock.
//!
//! Everything here is synchronous and side-effect free apart from the
//! receiver, so the transitions can be exercised without a disk.

use std::fmt::Write as _;
use std::sync::Arc;

use super::VerifyingFileError;
use crate::config::VerificationConfig;
use crate::hash_tree::{HashTree, TreeInfo};
use crate::range::{Range, RangeSet};
use crate::selection::{SelectionError, SelectionStrategy};
use crate::storage::DiskError;

/// The five disjoint range sets of one download plus corruption accounting.
pub(crate) struct FileState {
    pub size: u64,
    pub verified: RangeSet,
    pub partial: RangeSet,
    pub pending: RangeSet,
    pub leased: RangeSet,
    pub corrupt: RangeSet,
    pub lost_size: u64,
    pub lost_size_for_tree: u64,
    pub hash_tree: Option<Arc<dyn HashTree>>,
    pub expected_root: Option<String>,
    pub hash_tree_requested: bool,
    pub discard_corrupt: bool,
    pub stored_error: Option<DiskError>,
    pub jobs_in_flight: usize,
    pub is_open: bool,
    pub closed: bool,
    strategy: Box<dyn SelectionStrategy>,
    config: VerificationConfig,
}

/// Result of offering a hash tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeUpdate {
    Rejected,
    Accepted { verify: bool },
}

impl FileState {
    pub fn new(size: u64, strategy: Box<dyn SelectionStrategy>, config: VerificationConfig) -> Self {
        Self {
            size,
            verified: RangeSet::new(),
            partial: RangeSet::new(),
            pending: RangeSet::new(),
            leased: RangeSet::new(),
            corrupt: RangeSet::new(),
            lost_size: 0,
            lost_size_for_tree: 0,
            hash_tree: None,
            expected_root: None,
            hash_tree_requested: false,
            discard_corrupt: config.discard_corrupt,
            stored_error: None,
            jobs_in_flight: 0,
            is_open: false,
            closed: false,
            strategy,
            config,
        }
    }

    /// Bytes not held by any of the five sets.
    pub fn needed(&self) -> RangeSet {
        let mut needed = RangeSet::full(self.size);
        needed.remove_all(&self.verified);
        needed.remove_all(&self.partial);
        needed.remove_all(&self.pending);
        needed.remove_all(&self.leased);
        needed.remove_all(&self.corrupt);
        needed
    }

    pub fn free_bytes(&self) -> u64 {
        self.size.saturating_sub(
            self.verified.size()
                + self.partial.size()
                + self.pending.size()
                + self.leased.size()
                + self.corrupt.size(),
        )
    }

    pub fn chunk_size(&self) -> u64 {
        self.hash_tree
            .as_ref()
            .map(|tree| tree.node_size())
            .unwrap_or(self.config.default_chunk_size)
            .max(1)
    }

    pub fn lease_white(
        &mut self,
        candidates: Option<&RangeSet>,
        chunk_hint: Option<u64>,
    ) -> Result<Range, VerifyingFileError> {
        let needed = self.needed();
        let available = match candidates {
            Some(candidates) => needed.intersection(candidates),
            None => needed.clone(),
        };
        if available.is_empty() {
            return Err(VerifyingFileError::NoSuchElement);
        }

        let block_size = chunk_hint.unwrap_or_else(|| self.chunk_size()).max(1);
        let range = self
            .strategy
            .pick_assignment(&available, &needed, block_size)
            .map_err(|e| match e {
                SelectionError::NoCandidates => VerifyingFileError::NoSuchElement,
                other => VerifyingFileError::Selection(other),
            })?;

        if !available.contains(&range) {
            return Err(self.violation("lease_white", range));
        }
        self.leased.add(range);
        Ok(range)
    }

    pub fn release(&mut self, range: Range) -> Result<(), VerifyingFileError> {
        if !self.leased.contains(&range) {
            return Err(self.violation("release_block", range));
        }
        self.leased.delete(range);
        Ok(())
    }

    /// Moves a written range from leased to pending.
    ///
    /// Bytes already verified are skipped; the returned pieces are what
    /// actually has to reach the disk.
    pub fn begin_write(&mut self, range: Range) -> Result<Vec<Range>, VerifyingFileError> {
        let mut pieces = RangeSet::from_range(range);
        pieces.remove_all(&self.verified);
        if pieces.iter().any(|piece| !self.leased.contains(&piece)) {
            return Err(self.violation("write_block", range));
        }
        for piece in pieces.iter() {
            self.leased.delete(piece);
            self.pending.add(piece);
        }
        Ok(pieces.to_vec())
    }

    /// Undoes `begin_write` when the job could not be queued.
    pub fn abort_write(&mut self, pieces: &[Range]) {
        for piece in pieces {
            self.pending.delete(*piece);
            self.leased.add(*piece);
        }
    }

    /// Settles a disk write; returns true if chunks may now be verifiable.
    pub fn finish_write(&mut self, range: Range, result: Result<(), DiskError>) -> bool {
        self.pending.delete(range);
        match result {
            Ok(()) => {
                let mut written = RangeSet::from_range(range);
                written.remove_all(&self.verified);
                written.remove_all(&self.corrupt);
                self.partial.add_all(&written);
                self.hash_tree.is_some()
            }
            Err(error) => {
                tracing::error!("finish_write: write of {range} failed: {error}");
                self.stored_error = Some(error);
                false
            }
        }
    }

    /// Chunk-aligned partial ranges ready for tree verification.
    pub fn verifiable_chunks(&self) -> Vec<Range> {
        if self.hash_tree.is_none() || self.size == 0 {
            return Vec::new();
        }
        let chunk = self.chunk_size();
        let last_chunk_offset = match self.size - self.size % chunk {
            offset if offset == self.size => self.size.saturating_sub(chunk),
            offset => offset,
        };
        let short_tail = self.size % chunk != 0;

        let mut chunks = Vec::new();
        for written in self.partial.iter() {
            let mut low = match written.low() % chunk {
                0 => written.low(),
                rem => written.low() - rem + chunk,
            };
            while let Some(high) = low.checked_add(chunk - 1)
                && high <= written.high()
            {
                chunks.push(Range::new(low, high).unwrap_or(written));
                low += chunk;
            }
            if short_tail
                && written.high() == self.size - 1
                && written.low() <= last_chunk_offset
                && let Ok(tail) = Range::new(last_chunk_offset, self.size - 1)
            {
                chunks.push(tail);
            }
        }
        chunks
    }

    /// Records a verification result for a chunk checked under tree `root`.
    pub fn apply_verification(&mut self, chunk: Range, good: bool, root: &str) {
        let same_tree = self
            .hash_tree
            .as_ref()
            .is_some_and(|tree| tree.root() == root);
        if !same_tree || !self.partial.contains(&chunk) {
            tracing::trace!("apply_verification: stale result for {chunk}, ignoring");
            return;
        }

        self.partial.delete(chunk);
        if good {
            self.verified.add(chunk);
            tracing::trace!("apply_verification: {chunk} verified");
            return;
        }

        if !self.discard_corrupt {
            self.corrupt.add(chunk);
        }
        self.lost_size += chunk.len();
        self.lost_size_for_tree += chunk.len();
        tracing::warn!(
            "apply_verification: {chunk} failed verification, lost {} bytes total",
            self.lost_size
        );

        let tree_limit = self.config.max_corruption_for_tree * self.size as f64;
        if self.lost_size_for_tree as f64 > tree_limit {
            tracing::warn!(
                "apply_verification: abandoning tree {root} after {} corrupt bytes",
                self.lost_size_for_tree
            );
            self.hash_tree = None;
            self.lost_size_for_tree = 0;
        }
    }

    pub fn set_hash_tree(&mut self, tree: Option<Arc<dyn HashTree>>) -> TreeUpdate {
        let Some(tree) = tree else {
            self.hash_tree = None;
            self.lost_size_for_tree = 0;
            return TreeUpdate::Accepted { verify: false };
        };

        if let Some(expected) = &self.expected_root
            && expected != tree.root()
        {
            tracing::warn!(
                "set_hash_tree: root {} does not match expected {expected}",
                tree.root()
            );
            return TreeUpdate::Rejected;
        }
        if tree.file_size() != self.size {
            tracing::warn!(
                "set_hash_tree: tree describes {} bytes, file has {}",
                tree.file_size(),
                self.size
            );
            return TreeUpdate::Rejected;
        }

        let replaces_other = self
            .hash_tree
            .as_ref()
            .is_some_and(|current| current.root() != tree.root());
        if replaces_other {
            let churn_limit = self.config.tree_swap_limit_chunks * self.config.default_chunk_size;
            if self.verified.size() > churn_limit {
                tracing::debug!(
                    "set_hash_tree: keeping current tree, {} bytes already verified",
                    self.verified.size()
                );
                return TreeUpdate::Rejected;
            }
            let reverify = std::mem::take(&mut self.verified);
            self.partial.add_all(&reverify);
        }

        tracing::debug!(
            "set_hash_tree: installed tree {} (node size {})",
            tree.root(),
            tree.node_size()
        );
        self.hash_tree = Some(tree);
        self.lost_size_for_tree = 0;
        TreeUpdate::Accepted {
            verify: !self.partial.is_empty(),
        }
    }

    pub fn tree_info(&self) -> Option<TreeInfo> {
        self.hash_tree.as_ref().map(|tree| TreeInfo {
            node_size: tree.node_size(),
            root: tree.root().to_string(),
        })
    }

    pub fn is_complete(&self) -> bool {
        let mut covered = self.verified.size() + self.corrupt.size();
        if self.hash_tree.is_none() {
            covered += self.partial.size();
        }
        covered == self.size
    }

    pub fn is_hopeless(&self) -> bool {
        self.lost_size as f64 >= self.config.max_corruption * self.size as f64
    }

    /// Length of the contiguous written prefix starting at offset zero.
    pub fn preview_offset(&self) -> u64 {
        let mut written = self.verified.clone();
        written.add_all(&self.partial);
        match written.first() {
            Ok(first) if first.low() == 0 => first.high() + 1,
            _ => 0,
        }
    }

    /// Every range worth persisting across restarts.
    pub fn serializable_ranges(&self) -> RangeSet {
        let mut ranges = self.verified.clone();
        ranges.add_all(&self.partial);
        ranges.add_all(&self.corrupt);
        ranges
    }

    /// Returns true once waiting on disk jobs is the only way to make progress.
    pub fn should_wait_for_pending(&self) -> bool {
        !self.is_complete()
            && self.free_bytes() == 0
            && self.leased.is_empty()
            && self.jobs_in_flight > 0
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "size={} verified={} partial={} pending={} leased={} corrupt={} lost={} lost_for_tree={} tree={:?} jobs={}",
            self.size,
            self.verified,
            self.partial,
            self.pending,
            self.leased,
            self.corrupt,
            self.lost_size,
            self.lost_size_for_tree,
            self.tree_info(),
            self.jobs_in_flight,
        );
        out
    }

    fn violation(&self, operation: &'static str, range: Range) -> VerifyingFileError {
        let dump = self.dump();
        tracing::error!("{operation}: invariant violation on {range}: {dump}");
        VerifyingFileError::InvariantViolation {
            operation,
            range,
            dump,
        }
    }
}

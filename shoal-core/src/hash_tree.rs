//! Hash-tree verification capability.
//!
//! The download engine never computes tree hashes itself. A tree arrives
//! from a remote source or a local cache and is consulted chunk by chunk as
//! written bytes accumulate.

use std::fmt;

use crate::range::Range;

/// Verification capability for one file.
///
/// Implementations must be cheap to share; the engine holds them as
/// `Arc<dyn HashTree>` and calls `verify` from the disk queue task.
pub trait HashTree: Send + Sync + fmt::Debug {
    /// Identity of the tree root, compared against the expected root.
    fn root(&self) -> &str;

    /// Size of the file the tree describes.
    fn file_size(&self) -> u64;

    /// Bytes covered by one leaf node; the verification chunk size.
    fn node_size(&self) -> u64;

    /// Depth of the tree; deeper trees verify smaller chunks.
    fn depth(&self) -> u32;

    /// Returns true if the tree is fine-grained enough to stop looking for a better one.
    fn is_depth_good_enough(&self) -> bool {
        true
    }

    /// Checks `data`, the on-disk bytes of `range`, against the tree.
    fn verify(&self, range: Range, data: &[u8]) -> bool;

    /// Returns true if this tree should replace `current`.
    fn is_better_than(&self, current: Option<&dyn HashTree>) -> bool {
        match current {
            None => true,
            Some(current) => self.depth() > current.depth(),
        }
    }
}

/// Snapshot of the active tree's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInfo {
    pub node_size: u64,
    pub root: String,
}

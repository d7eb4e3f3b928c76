//! SHA-1 Merkle tree over fixed-size chunks.

use sha1::{Digest, Sha1};
use shoal_core::hash_tree::HashTree;
use shoal_core::range::Range;

const LEAF_PREFIX: u8 = 0;
const NODE_PREFIX: u8 = 1;

type Digest20 = [u8; 20];

/// Hash tree with one SHA-1 leaf per `node_size` chunk of the file.
///
/// The last chunk may be short. The root is the hex digest of a binary
/// Merkle tree over the leaves.
#[derive(Debug, Clone)]
pub struct Sha1ChunkTree {
    root: String,
    file_size: u64,
    node_size: u64,
    leaves: Vec<Digest20>,
}

impl Sha1ChunkTree {
    /// Builds the tree for `data`.
    ///
    /// # Panics
    ///
    /// Panics if `node_size` is zero.
    pub fn build(data: &[u8], node_size: u64) -> Self {
        assert!(node_size > 0, "node size must be positive");
        let leaves: Vec<Digest20> = data
            .chunks(node_size as usize)
            .map(|chunk| digest(LEAF_PREFIX, &[chunk]))
            .collect();
        Self {
            root: hex::encode(merkle_root(&leaves)),
            file_size: data.len() as u64,
            node_size,
            leaves,
        }
    }

    /// Same leaves under a different claimed root, for mismatch tests.
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }
}

impl HashTree for Sha1ChunkTree {
    fn root(&self) -> &str {
        &self.root
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn node_size(&self) -> u64 {
        self.node_size
    }

    fn depth(&self) -> u32 {
        match self.leaves.len() {
            0 | 1 => 0,
            n => usize::BITS - (n - 1).leading_zeros(),
        }
    }

    fn verify(&self, range: Range, data: &[u8]) -> bool {
        if range.low() % self.node_size != 0 || data.len() as u64 != range.len() {
            return false;
        }
        let index = (range.low() / self.node_size) as usize;
        let expected_len = self.node_size.min(self.file_size - range.low());
        if range.len() != expected_len {
            return false;
        }
        self.leaves
            .get(index)
            .is_some_and(|leaf| *leaf == digest(LEAF_PREFIX, &[data]))
    }
}

fn digest(prefix: u8, parts: &[&[u8]]) -> Digest20 {
    let mut hasher = Sha1::new();
    hasher.update([prefix]);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn merkle_root(leaves: &[Digest20]) -> Digest20 {
    if leaves.is_empty() {
        return digest(LEAF_PREFIX, &[]);
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => digest(NODE_PREFIX, &[left.as_slice(), right.as_slice()]),
                // odd node out is promoted unchanged
                _ => pair[0],
            })
            .collect();
    }
    level[0]
}

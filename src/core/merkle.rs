// Merkle tree over transaction signatures

use crate::core::double_sha256_hex;

/// Commitment tree over an ordered batch of leaf signatures
///
/// Leaves are double-hashed before pairing. Parents carry the double hash of
/// their children's signatures concatenated left to right. When a level has
/// an odd number of nodes the last one is promoted unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    root: String,
    depth: usize,
    node_count: usize,
}

impl MerkleTree {
    /// Build a tree from an ordered, non-empty list of leaf signatures
    pub fn new<S: AsRef<str>>(leaves: &[S]) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }

        let mut level: Vec<String> = leaves
            .iter()
            .map(|leaf| double_sha256_hex(leaf.as_ref()))
            .collect();
        let mut node_count = level.len();
        let mut depth = 0;

        // A lone leaf still gets a (promoted) parent level
        loop {
            level = Self::parent_level(level);
            depth += 1;
            node_count += level.len();
            if level.len() == 1 {
                break;
            }
        }

        let root = level.pop()?;
        Some(Self {
            root,
            depth,
            node_count,
        })
    }

    fn parent_level(children: Vec<String>) -> Vec<String> {
        let mut parents = Vec::with_capacity(children.len().div_ceil(2));
        let mut iter = children.into_iter();

        while let Some(left) = iter.next() {
            match iter.next() {
                Some(right) => parents.push(double_sha256_hex(&format!("{}{}", left, right))),
                None => parents.push(left),
            }
        }

        parents
    }

    /// Root signature as a hex string
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Number of levels built above the leaves
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total nodes, leaves included
    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

// Block data structures

use crate::core::{double_sha256_hex, BlockHash, Timestamp, Transaction, TransactionBatch};
use serde::{Deserialize, Serialize};

/// Block - a resolved hash over a sealed transaction batch
///
/// The Merkle root is not stored; it is recomputed from the batch on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Hash of the previous block (empty for genesis)
    pub prev_hash: BlockHash,
    /// Creation time (ms since epoch)
    pub time_stamp: Timestamp,
    /// Hash resolved by the mining race
    pub hash: BlockHash,
    /// Transactions in this block
    pub transactions: TransactionBatch,
}

impl Block {
    /// Create a new block
    pub fn new(prev_hash: BlockHash, time_stamp: Timestamp, hash: BlockHash, transactions: TransactionBatch) -> Self {
        Self {
            prev_hash,
            time_stamp,
            hash,
            transactions,
        }
    }

    /// Create the genesis block
    pub fn genesis() -> Self {
        Self {
            prev_hash: String::new(),
            time_stamp: 0,
            hash: double_sha256_hex("genesis"),
            transactions: TransactionBatch::seal(Vec::new()),
        }
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Merkle root over the block's transactions
    pub fn merkle_root(&self) -> Option<String> {
        self.transactions
            .merkle_tree()
            .map(|tree| tree.root().to_string())
    }

    pub fn transactions(&self) -> &[Transaction] {
        self.transactions.transactions()
    }

    /// Serialized form handed to the storage collaborator
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> TransactionBatch {
        TransactionBatch::seal(vec![
            Transaction::new("a", "/a", 1),
            Transaction::new("b", "/b", 2),
            Transaction::new("c", "/c", 3),
            Transaction::new("d", "/d", 4),
        ])
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();
        assert!(genesis.is_genesis());
        assert!(genesis.transactions().is_empty());
        assert!(genesis.merkle_root().is_none());
        assert_eq!(genesis, Block::genesis());
    }

    #[test]
    fn test_merkle_root_recomputed() {
        let batch = sample_batch();
        let expected = batch.merkle_tree().unwrap().root().to_string();
        let block = Block::new("prev".into(), 10, "hash".into(), batch);

        assert!(!block.is_genesis());
        assert_eq!(block.merkle_root(), Some(expected));
    }

    #[test]
    fn test_block_json() {
        let block = Block::new("prev".into(), 10, "hash".into(), sample_batch());
        let json = block.to_json().unwrap();
        assert!(json.contains("\"prevHash\":\"prev\""));

        let decoded = Block::from_json(&json).unwrap();
        assert_eq!(decoded, block);
    }
}

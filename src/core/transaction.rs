// File-upload transactions and sealed batches

use crate::core::{MerkleTree, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A file-upload transaction
///
/// Ordered by creation timestamp, then by name and payload so the ordering
/// is total and agrees with equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Uploaded file name
    pub file_name: String,
    /// Path or summary of the uploaded payload
    pub payload: String,
    /// Creation time (ms since epoch)
    pub time_stamp: Timestamp,
}

impl Transaction {
    pub fn new(file_name: impl Into<String>, payload: impl Into<String>, time_stamp: Timestamp) -> Self {
        Self {
            file_name: file_name.into(),
            payload: payload.into(),
            time_stamp,
        }
    }

    /// Build an upload transaction from a file path
    /// The file name is the last `/`-separated segment of the path
    pub fn upload(path: &str, time_stamp: Timestamp) -> Self {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        Self::new(file_name, path, time_stamp)
    }

    /// Canonical string form, used as the Merkle leaf and in block ids
    pub fn signature(&self) -> String {
        format!("{}:{}:{}", self.file_name, self.payload, self.time_stamp)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl Ord for Transaction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time_stamp
            .cmp(&other.time_stamp)
            .then_with(|| self.file_name.cmp(&other.file_name))
            .then_with(|| self.payload.cmp(&other.payload))
    }
}

impl PartialOrd for Transaction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A sealed, fixed-size batch of transactions in ascending timestamp order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionBatch {
    transactions: Vec<Transaction>,
}

impl TransactionBatch {
    /// Seal a batch; the caller guarantees ordering and capacity
    pub(crate) fn seal(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn signatures(&self) -> Vec<String> {
        self.transactions.iter().map(Transaction::signature).collect()
    }

    /// Identifier peers use to arbitrate the mining race for this batch
    pub fn block_id(&self) -> String {
        self.signatures().concat()
    }

    /// Merkle tree over the transaction signatures (None for an empty batch)
    pub fn merkle_tree(&self) -> Option<MerkleTree> {
        MerkleTree::new(&self.signatures())
    }
}

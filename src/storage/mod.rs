// Storage collaborator for finalized blocks

mod blockchain_db;
mod memory;

pub use blockchain_db::SledBlockStore;
pub use memory::MemoryBlockStore;

use thiserror::Error;

/// Errors reported by a block store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("stored value is not valid UTF-8")]
    Encoding,

    #[error("block serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("write rejected for block {0}")]
    Rejected(String),
}

/// Key-value contract for serialized blocks
///
/// Failures are reported to the caller, never retried here.
pub trait BlockStore: Send + Sync {
    fn put(&self, block_hash: &str, serialized_block: &str) -> Result<(), StorageError>;

    fn get(&self, block_hash: &str) -> Result<Option<String>, StorageError>;
}

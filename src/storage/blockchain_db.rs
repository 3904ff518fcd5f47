// Block database using sled

use crate::storage::{BlockStore, StorageError};
use sled::Db;
use std::path::Path;

/// sled-backed block store, keyed by block hash
pub struct SledBlockStore {
    db: Db,
}

impl SledBlockStore {
    /// Open (or create) a block database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Database(format!("Failed to open database: {}", e)))?;
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| StorageError::Database(format!("Failed to create memory db: {}", e)))?;
        Ok(Self { db })
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.db.scan_prefix(b"b").count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Manually flush database
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Database(format!("Failed to flush: {}", e)))?;
        Ok(())
    }

    // Helper: create key for block storage
    fn block_key(block_hash: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(block_hash.len() + 1);
        key.push(b'b'); // 'b' for block
        key.extend_from_slice(block_hash.as_bytes());
        key
    }
}

impl BlockStore for SledBlockStore {
    fn put(&self, block_hash: &str, serialized_block: &str) -> Result<(), StorageError> {
        self.db
            .insert(Self::block_key(block_hash), serialized_block.as_bytes())
            .map_err(|e| StorageError::Database(format!("Failed to store block: {}", e)))?;
        Ok(())
    }

    fn get(&self, block_hash: &str) -> Result<Option<String>, StorageError> {
        match self
            .db
            .get(Self::block_key(block_hash))
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            Some(data) => {
                let text = String::from_utf8(data.to_vec()).map_err(|_| StorageError::Encoding)?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }
}

// In-memory block store

use crate::storage::{BlockStore, StorageError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Volatile block store; writes can be switched to fail
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, block_hash: &str, serialized_block: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected(block_hash.to_string()));
        }
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(block_hash.to_string(), serialized_block.to_string());
        Ok(())
    }

    fn get(&self, block_hash: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(block_hash)
            .cloned())
    }
}

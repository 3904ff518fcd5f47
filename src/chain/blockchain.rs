// Append-only chain of blocks

use crate::core::Block;
use crate::storage::StorageError;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised when appending to the chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Block was built against a tip that is no longer current
    #[error("link conflict: block points at '{found}' but tip is '{expected}'")]
    LinkConflict { expected: String, found: String },

    #[error("block {0} is already in the chain")]
    DuplicateHash(String),

    #[error("first block must be a genesis block")]
    NotGenesis,
}

/// Errors raised while finalizing a block across memory and storage
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("block could not be persisted: {0}")]
    Persistence(#[from] StorageError),
}

/// Append-only sequence of blocks addressable by hash
#[derive(Debug, Default, Clone)]
pub struct ChainStore {
    blocks: HashMap<String, Block>,
    order: Vec<String>,
}

impl ChainStore {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain holding only the genesis block
    pub fn with_genesis() -> Self {
        let genesis = Block::genesis();
        let mut chain = Self::new();
        chain.order.push(genesis.hash.clone());
        chain.blocks.insert(genesis.hash.clone(), genesis);
        chain
    }

    /// Check that `block` may become the new tip
    pub fn check_link(&self, block: &Block) -> Result<(), ChainError> {
        match self.tip_hash() {
            None if block.is_genesis() => {}
            None => return Err(ChainError::NotGenesis),
            Some(tip) if block.prev_hash != tip => {
                return Err(ChainError::LinkConflict {
                    expected: tip.to_string(),
                    found: block.prev_hash.clone(),
                });
            }
            Some(_) => {}
        }

        if self.blocks.contains_key(&block.hash) {
            return Err(ChainError::DuplicateHash(block.hash.clone()));
        }

        Ok(())
    }

    /// Append a block; on error the chain is unchanged
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        self.check_link(&block)?;
        self.commit(block);
        Ok(())
    }

    /// Append a block only if `persist` succeeds
    ///
    /// The link is validated first, then `persist` runs, then the block is
    /// committed. Any failure leaves the chain unchanged.
    pub fn append_with<F>(&mut self, block: Block, persist: F) -> Result<(), FinalizeError>
    where
        F: FnOnce(&Block) -> Result<(), StorageError>,
    {
        self.check_link(&block)?;
        persist(&block)?;
        self.commit(block);
        Ok(())
    }

    fn commit(&mut self, block: Block) {
        self.order.push(block.hash.clone());
        self.blocks.insert(block.hash.clone(), block);
    }

    pub fn get_block(&self, hash: &str) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn tip(&self) -> Option<&Block> {
        self.order.last().and_then(|hash| self.blocks.get(hash))
    }

    pub fn tip_hash(&self) -> Option<&str> {
        self.order.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Blocks from genesis to tip
    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.order.iter().filter_map(|hash| self.blocks.get(hash))
    }

    /// Owned snapshot of the chain, genesis first
    pub fn snapshot(&self) -> Vec<Block> {
        self.iter().cloned().collect()
    }
}

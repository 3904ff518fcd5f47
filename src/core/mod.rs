// Core ledger data structures

mod types;
mod hash;
mod merkle;
mod transaction;
mod block;

pub use types::*;
pub use hash::*;
pub use merkle::MerkleTree;
pub use transaction::{Transaction, TransactionBatch};
pub use block::Block;

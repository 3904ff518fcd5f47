// Chain state and block production

mod batcher;
mod blockchain;
mod manager;

pub use batcher::TransactionBatcher;
pub use blockchain::{ChainError, ChainStore, FinalizeError};
pub use manager::{BlockchainManager, ProductionError};

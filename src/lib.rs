// Replicated file-upload ledger
// Blocks are produced by a proof-of-work race between peers

pub mod core;
pub mod consensus;
pub mod chain;
pub mod storage;
pub mod network;
pub mod config;
mod cli;

// Re-exports for convenience
pub use self::core::{Block, MerkleTree, Transaction, TransactionBatch};
pub use consensus::{HashCandidate, HashRaceCollector, Miner, MiningOutcome, Target};
pub use chain::{BlockchainManager, ChainError, ChainStore, TransactionBatcher};
pub use storage::{BlockStore, MemoryBlockStore, SledBlockStore, StorageError};
pub use network::{BroadcastKind, BroadcastMessage, Node, PeerSet};
pub use config::{ChainConfig, HeartbeatConfig, NodeConfig};
pub use cli::{Cli, CliHandler};

// Proof-of-work search and race arbitration

pub mod pow;
pub mod race;

pub use pow::{Miner, MiningJob, MiningOutcome, MiningResult, Target};
pub use race::{HashCandidate, HashRaceCollector, MiningSession};

// Proof of Work implementation

use crate::consensus::MiningSession;
use crate::core::{BlockDigest, BlockHash, Timestamp, TransactionBatch};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Difficulty target: the digest must start with `zero_bytes` zero bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub zero_bytes: usize,
}

impl Target {
    pub fn new(zero_bytes: usize) -> Self {
        Self { zero_bytes }
    }

    /// Check if a digest meets this target
    pub fn is_valid_hash(&self, digest: &[u8]) -> bool {
        digest.len() >= self.zero_bytes && digest[..self.zero_bytes].iter().all(|b| *b == 0)
    }

    /// Leading zero bits required by this target
    pub fn leading_zeros(&self) -> u32 {
        (self.zero_bytes as u32) * 8
    }
}

impl Default for Target {
    /// Most-significant byte must be zero (about 256 trials)
    fn default() -> Self {
        Self { zero_bytes: 1 }
    }
}

/// Inputs for one proof-of-work search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningJob {
    pub block_id: String,
    pub prev_hash: BlockHash,
    pub time_stamp: Timestamp,
    pub merkle_root: String,
}

impl MiningJob {
    /// Build a job for a sealed batch; None if the batch is empty
    pub fn from_batch(batch: &TransactionBatch, prev_hash: &str, time_stamp: Timestamp) -> Option<Self> {
        let tree = batch.merkle_tree()?;
        Some(Self {
            block_id: batch.block_id(),
            prev_hash: prev_hash.to_string(),
            time_stamp,
            merkle_root: tree.root().to_string(),
        })
    }

    /// Canonical preimage; the nonce is appended per attempt
    pub fn preimage(&self) -> String {
        format!("{{{}:{}:{}", self.time_stamp, self.prev_hash, self.merkle_root)
    }

    fn with_nonce(preimage: &str, nonce: u64) -> String {
        format!("{}:{}}}", preimage, nonce)
    }
}

/// How a mining run ended
#[derive(Debug)]
pub enum MiningOutcome {
    /// A nonce satisfying the target was found
    Found(MiningResult),
    /// Another peer's candidate arrived first; the search was abandoned
    Preempted { attempts: u64 },
    /// Nonce ceiling reached without a valid digest
    Exhausted { attempts: u64, best_score: Option<u64> },
}

/// Mining result
#[derive(Debug, Clone)]
pub struct MiningResult {
    /// The nonce that was found
    pub nonce: u64,
    /// Hex-encoded winning digest
    pub hash: BlockHash,
    /// Number of attempts
    pub attempts: u64,
    /// Lowest non-zero value of the first 8 digest bytes seen (diagnostic only)
    pub best_score: Option<u64>,
    /// Time taken
    pub duration: Duration,
}

impl MiningResult {
    /// Calculate hash rate (hashes per second)
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64().max(f64::EPSILON)
    }
}

/// Proof of Work miner
pub struct Miner {
    pub target: Target,
    digest: Arc<dyn BlockDigest>,
    max_nonce: u64,
    /// Nonces between two checks of the session's preemption flag
    cancel_check_interval: u64,
}

impl Miner {
    pub fn new(target: Target, digest: Arc<dyn BlockDigest>) -> Self {
        Self {
            target,
            digest,
            max_nonce: u64::MAX,
            cancel_check_interval: 1,
        }
    }

    pub fn with_max_nonce(mut self, max_nonce: u64) -> Self {
        self.max_nonce = max_nonce;
        self
    }

    pub fn with_cancel_check_interval(mut self, interval: u64) -> Self {
        self.cancel_check_interval = interval.max(1);
        self
    }

    /// Search for a nonce, polling the session for preemption
    ///
    /// CPU-bound and blocking; run it off the async executor.
    pub fn mine(&self, job: &MiningJob, session: &MiningSession) -> MiningOutcome {
        let start_time = Instant::now();
        let preimage = job.preimage();
        let mut attempts = 0u64;
        let mut best_score: Option<u64> = None;

        if session.is_preempted() {
            return MiningOutcome::Preempted { attempts };
        }

        for nonce in 0..self.max_nonce {
            if nonce % self.cancel_check_interval == 0 && session.is_preempted() {
                log::debug!("Mining {} preempted after {} attempts", short_id(&job.block_id), attempts);
                return MiningOutcome::Preempted { attempts };
            }

            let digest = self.digest.digest(MiningJob::with_nonce(&preimage, nonce).as_bytes());
            attempts += 1;

            let score = leading_score(&digest);
            if score > 0 && best_score.is_none_or(|best| score < best) {
                best_score = Some(score);
            }

            if self.target.is_valid_hash(&digest) {
                return MiningOutcome::Found(MiningResult {
                    nonce,
                    hash: hex::encode(&digest),
                    attempts,
                    best_score,
                    duration: start_time.elapsed(),
                });
            }

            // Progress indicator every 100k attempts
            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!("Mining attempts: {} ({:.1} KH/s)",
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }
        }

        MiningOutcome::Exhausted { attempts, best_score }
    }

    /// Verify that a nonce satisfies the target for a job
    pub fn verify(&self, job: &MiningJob, nonce: u64) -> bool {
        let digest = self.digest.digest(MiningJob::with_nonce(&job.preimage(), nonce).as_bytes());
        self.target.is_valid_hash(&digest)
    }
}

/// Big-endian value of the first 8 digest bytes
fn leading_score(digest: &[u8]) -> u64 {
    digest
        .iter()
        .take(8)
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

pub(crate) fn short_id(block_id: &str) -> &str {
    let end = block_id
        .char_indices()
        .nth(24)
        .map(|(i, _)| i)
        .unwrap_or(block_id.len());
    &block_id[..end]
}

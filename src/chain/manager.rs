// Block production pipeline: batcher -> miner -> race -> chain -> storage

use crate::chain::{ChainError, ChainStore, FinalizeError, TransactionBatcher};
use crate::config::{ChainConfig, ConfigError};
use crate::consensus::pow::short_id;
use crate::consensus::{HashCandidate, HashRaceCollector, Miner, MiningJob, MiningOutcome, Target};
use crate::core::{now_millis, Block, BlockDigest, Timestamp, Transaction, TransactionBatch};
use crate::network::{BroadcastKind, BroadcastMessage, IngestError};
use crate::storage::{BlockStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors from one block-production run
#[derive(Debug, Error)]
pub enum ProductionError {
    #[error("cannot mine an empty batch")]
    EmptyBatch,

    #[error("no candidate hash was recorded for block {0}")]
    NoCandidate(String),

    #[error("mining task failed: {0}")]
    MinerFailed(String),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error("block still conflicts with the tip after {0} re-mining attempts")]
    RemineExhausted(u32),
}

/// Orchestrates block production and exposes the ingest API
pub struct BlockchainManager {
    config: ChainConfig,
    chain: RwLock<ChainStore>,
    batcher: TransactionBatcher,
    collector: HashRaceCollector,
    miner: Arc<Miner>,
    storage: Arc<dyn BlockStore>,
    events: broadcast::Sender<BroadcastMessage>,
}

impl BlockchainManager {
    /// Create a manager using the configured digest
    pub fn new(config: ChainConfig, storage: Arc<dyn BlockStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        let digest = config.block_digest()?;
        Ok(Self::with_digest(config, storage, digest))
    }

    /// Create a manager with an explicit proof-of-work digest
    pub fn with_digest(config: ChainConfig, storage: Arc<dyn BlockStore>, digest: Arc<dyn BlockDigest>) -> Self {
        let miner = Miner::new(Target::new(config.difficulty_zero_bytes), digest)
            .with_max_nonce(config.max_nonce)
            .with_cancel_check_interval(config.cancel_check_interval);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            batcher: TransactionBatcher::new(config.block_size, config.max_timeout_ms as i64),
            collector: HashRaceCollector::new(config.recent_resolved_capacity)
                .with_unclaimed_ttl(config.unclaimed_hash_ttl()),
            chain: RwLock::new(ChainStore::with_genesis()),
            miner: Arc::new(miner),
            storage,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Subscribe to every broadcast this node emits
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.events.subscribe()
    }

    pub fn collector(&self) -> &HashRaceCollector {
        &self.collector
    }

    /// Create an upload transaction for `path` and ingest it
    pub fn upload_file(&self, path: &str) -> Transaction {
        let transaction = Transaction::upload(path, now_millis());
        self.ingest_transaction(transaction.clone());
        transaction
    }

    /// Queue a local transaction and announce it to peers
    pub fn ingest_transaction(&self, transaction: Transaction) {
        let data = match transaction.to_json() {
            Ok(data) => data,
            Err(e) => {
                log::error!("Failed to encode transaction {}: {}", transaction.file_name, e);
                return;
            }
        };
        log::info!("Transaction for {} added, broadcasting", transaction.file_name);
        self.batcher.submit(transaction);
        self.broadcast(data, BroadcastKind::Transaction, None);
    }

    /// Queue a transaction a peer announced (not re-broadcast)
    pub fn add_transaction(&self, transaction: Transaction) {
        log::debug!("Peer transaction for {} queued", transaction.file_name);
        self.batcher.submit(transaction);
    }

    /// Emit a message to all subscribers; returns its send timestamp
    pub fn broadcast(&self, data: String, kind: BroadcastKind, block_id: Option<String>) -> Timestamp {
        let time_stamp = now_millis();
        let message = BroadcastMessage::new(kind, data, time_stamp, block_id);
        if self.events.send(message).is_err() {
            log::debug!("No subscribers for {:?} broadcast", kind);
        }
        time_stamp
    }

    /// Register a peer's candidate hash for arbitration
    pub fn receive_external_hash(&self, hash: String, time_stamp: Timestamp, block_id: &str) -> bool {
        log::debug!("External hash {} for block {} (t={})", hash, short_id(block_id), time_stamp);
        self.collector
            .record_external(block_id, HashCandidate::new(hash, time_stamp))
    }

    /// Parse a raw broadcast from the network and dispatch it
    pub fn ingest_message(&self, raw: &str) -> Result<(), IngestError> {
        let result = BroadcastMessage::parse(raw).and_then(|message| self.handle_message(message));
        if let Err(e) = &result {
            log::warn!("Dropping broadcast: {}", e);
        }
        result
    }

    fn handle_message(&self, message: BroadcastMessage) -> Result<(), IngestError> {
        match message.kind() {
            Some(BroadcastKind::Transaction) => {
                let transaction = Transaction::from_json(&message.data)?;
                self.add_transaction(transaction);
                Ok(())
            }
            Some(BroadcastKind::MinedHash) => {
                let block_id = message.block_id.ok_or(IngestError::MissingBlockId)?;
                self.receive_external_hash(message.data, message.time_stamp, &block_id);
                Ok(())
            }
            None => Err(IngestError::UnknownFlag(message.flag)),
        }
    }

    /// Run one batcher tick; returns the batches sealed by it
    pub fn seal_ready_batches(&self, now: Timestamp) -> Vec<TransactionBatch> {
        self.batcher.tick(now)
    }

    pub fn pending_transactions(&self) -> usize {
        self.batcher.queued() + self.batcher.in_progress()
    }

    /// Mine a sealed batch, resolve the race and finalize the block
    ///
    /// A link conflict re-mines the batch against the new tip.
    pub async fn on_batch_sealed(&self, batch: TransactionBatch) -> Result<Block, ProductionError> {
        let mut remined = 0;

        loop {
            let prev_hash = self.tip_hash().await;
            let time_stamp = now_millis();
            let winner = self.mine_and_resolve(&batch, &prev_hash, time_stamp).await?;
            let block = Block::new(prev_hash, time_stamp, winner.hash, batch.clone());

            match self.finalize(block).await {
                Ok(block) => return Ok(block),
                Err(FinalizeError::Chain(ChainError::LinkConflict { expected, .. })) => {
                    if remined >= self.config.remine_attempts {
                        log::error!("Giving up on batch after {} link conflicts", remined);
                        return Err(ProductionError::RemineExhausted(remined));
                    }
                    remined += 1;
                    log::warn!("Tip moved to {} while mining, re-mining batch ({})", expected, remined);
                }
                Err(e) => {
                    log::error!("Block finalization failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    async fn mine_and_resolve(
        &self,
        batch: &TransactionBatch,
        prev_hash: &str,
        time_stamp: Timestamp,
    ) -> Result<HashCandidate, ProductionError> {
        let job = MiningJob::from_batch(batch, prev_hash, time_stamp).ok_or(ProductionError::EmptyBatch)?;
        let block_id = job.block_id.clone();
        let session = self.collector.open_session(&block_id);

        log::info!("Mining block {} on top of {}", short_id(&block_id), prev_hash);
        let miner = Arc::clone(&self.miner);
        let mining = session.clone();
        let outcome = match tokio::task::spawn_blocking(move || miner.mine(&job, &mining)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Close the session so its race entry does not linger
                self.collector.resolve(&session);
                return Err(ProductionError::MinerFailed(e.to_string()));
            }
        };

        match outcome {
            MiningOutcome::Found(result) => {
                log::info!(
                    "Found nonce {} after {} attempts ({:.1} H/s, best score {:?})",
                    result.nonce,
                    result.attempts,
                    result.hash_rate(),
                    result.best_score
                );
                let sent_at = self.broadcast(result.hash.clone(), BroadcastKind::MinedHash, Some(block_id.clone()));
                self.collector
                    .record_local(&session, HashCandidate::new(result.hash, sent_at));
            }
            MiningOutcome::Preempted { attempts } => {
                log::info!("Peer hash arrived first after {} attempts, adopting it", attempts);
            }
            MiningOutcome::Exhausted { attempts, .. } => {
                log::warn!("Nonce space exhausted after {} attempts", attempts);
            }
        }

        tokio::time::sleep(self.config.grace_window()).await;

        self.collector
            .resolve(&session)
            .ok_or(ProductionError::NoCandidate(block_id))
    }

    /// Append to the chain and persist as one step
    async fn finalize(&self, block: Block) -> Result<Block, FinalizeError> {
        let serialized = block.to_json().map_err(StorageError::from)?;
        let mut chain = self.chain.write().await;
        chain.check_link(&block)?;

        // The tip cannot move while the write guard is held
        let storage = Arc::clone(&self.storage);
        let hash = block.hash.clone();
        let persisted = tokio::task::spawn_blocking(move || storage.put(&hash, &serialized))
            .await
            .unwrap_or_else(|e| Err(StorageError::Database(e.to_string())));

        chain.append_with(block.clone(), |_| persisted)?;
        log::info!("Block {} appended, chain length {}", block.hash, chain.len());

        Ok(block)
    }

    pub async fn tip_hash(&self) -> String {
        self.chain
            .read()
            .await
            .tip_hash()
            .unwrap_or_default()
            .to_string()
    }

    pub async fn get_blockchain_length(&self) -> usize {
        self.chain.read().await.len()
    }

    pub async fn get_block(&self, hash: &str) -> Option<Block> {
        self.chain.read().await.get_block(hash).cloned()
    }

    /// Read-only snapshot of the chain, genesis first
    pub async fn get_blockchain(&self) -> Vec<Block> {
        self.chain.read().await.snapshot()
    }
}

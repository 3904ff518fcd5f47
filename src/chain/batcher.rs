// Timestamp-ordered transaction batching

use crate::core::{Timestamp, Transaction, TransactionBatch};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Buffers transactions and seals fixed-size batches
///
/// Many producers may `submit`; `tick` is the single consumer.
pub struct TransactionBatcher {
    block_size: usize,
    max_timeout_ms: i64,
    queue: Mutex<BinaryHeap<Reverse<Transaction>>>,
    current: Mutex<Vec<Transaction>>,
}

impl TransactionBatcher {
    pub fn new(block_size: usize, max_timeout_ms: i64) -> Self {
        Self {
            block_size: block_size.max(1),
            max_timeout_ms,
            queue: Mutex::new(BinaryHeap::new()),
            current: Mutex::new(Vec::with_capacity(block_size)),
        }
    }

    fn queue(&self) -> MutexGuard<'_, BinaryHeap<Reverse<Transaction>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> MutexGuard<'_, Vec<Transaction>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a transaction; duplicates are kept
    pub fn submit(&self, transaction: Transaction) {
        self.queue().push(Reverse(transaction));
    }

    /// Transactions waiting to become eligible
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Eligible transactions collected into the unsealed batch
    pub fn in_progress(&self) -> usize {
        self.current().len()
    }

    /// Move every transaction older than `now - max_timeout_ms` into the
    /// current batch, oldest first, sealing each time the batch fills
    pub fn tick(&self, now: Timestamp) -> Vec<TransactionBatch> {
        let cutoff = now - self.max_timeout_ms;
        let mut sealed = Vec::new();
        let mut current = self.current();
        let mut queue = self.queue();

        while queue
            .peek()
            .is_some_and(|Reverse(oldest)| oldest.time_stamp < cutoff)
        {
            let Some(Reverse(transaction)) = queue.pop() else {
                break;
            };
            current.push(transaction);

            if current.len() == self.block_size {
                let batch = std::mem::replace(&mut *current, Vec::with_capacity(self.block_size));
                log::info!("Sealed batch of {} transactions", batch.len());
                sealed.push(TransactionBatch::seal(batch));
            }
        }

        sealed
    }
}

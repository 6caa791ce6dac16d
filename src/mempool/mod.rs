//! Transaction pool
//!
//! Holds transactions waiting for the next block. Locally submitted
//! transactions are queued for gossip; received ones are only inserted.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;

use crate::codec::SerializationError;
use crate::consensus::Transaction;
use crate::crypto::Hash;

#[derive(Debug, Default)]
struct PoolInner {
    /// Arrival order
    queue: VecDeque<(Hash, Transaction)>,
    hashes: HashSet<Hash>,
}

/// Pending transactions, shared between the RPC, gossip and mining paths
pub struct TxPool {
    inner: Mutex<PoolInner>,
    outbound_tx: mpsc::UnboundedSender<Transaction>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Transaction>>>,
}

impl TxPool {
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(PoolInner::default()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    /// Add a transaction; returns `false` if it is already pooled
    pub fn insert(&self, tx: Transaction) -> Result<bool, SerializationError> {
        let hash = tx.hash()?;
        let mut inner = self.inner.lock();
        if !inner.hashes.insert(hash) {
            return Ok(false);
        }
        inner.queue.push_back((hash, tx));
        Ok(true)
    }

    /// Queue a transaction for the outbound forwarder
    pub fn broadcast(&self, tx: Transaction) {
        if self.outbound_tx.send(tx).is_err() {
            warn!("Transaction forwarder is gone; not broadcasting");
        }
    }

    /// Receiver of the outbound queue; available once
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Transaction>> {
        self.outbound_rx.lock().take()
    }

    /// Decode a gossiped transaction and pool it
    pub fn handle_gossip(&self, payload: &[u8]) -> Result<bool, SerializationError> {
        let tx = Transaction::deserialize(payload)?;
        let added = self.insert(tx)?;
        if added {
            debug!("Pooled gossiped transaction ({} pending)", self.len());
        }
        Ok(added)
    }

    /// Remove up to `max` transactions in arrival order
    pub fn drain(&self, max: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let count = max.min(inner.queue.len());
        let drained: Vec<(Hash, Transaction)> = inner.queue.drain(..count).collect();
        drained
            .into_iter()
            .map(|(hash, tx)| {
                inner.hashes.remove(&hash);
                tx
            })
            .collect()
    }

    /// Put transactions back at the front, keeping their order
    pub fn restore(&self, transactions: Vec<Transaction>) {
        let mut inner = self.inner.lock();
        for tx in transactions.into_iter().rev() {
            let Ok(hash) = tx.hash() else { continue };
            if inner.hashes.insert(hash) {
                inner.queue.push_front((hash, tx));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

impl Default for TxPool {
    fn default() -> Self {
        Self::new()
    }
}

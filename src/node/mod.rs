//! Node wiring
//!
//! Ties the chain owner, the transaction pool and the overlay together:
//! transactions arrive over RPC or the `transaction` topic, mined blocks are
//! announced on `blockadded`, and a competing announcement for the height
//! being mined cancels the local attempt.

mod announcement;
mod chain_owner;

pub use announcement::BlockAnnouncement;
pub use chain_owner::{ChainHandle, ChainStatus};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::SerializationError;
use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{Block, CancelFlag, Transaction};
use crate::crypto::Hash;
use crate::mempool::TxPool;
use crate::p2p::{GossipMessage, Network, NetworkError, PeerId};
use crate::storage::ChainError;

/// Topic carrying serialized transactions
pub const TRANSACTION_TOPIC: &str = "transaction";

/// Topic carrying [`BlockAnnouncement`]s
pub const BLOCK_TOPIC: &str = "blockadded";

/// Most transactions drained from the pool into one block
pub const MAX_BLOCK_TRANSACTIONS: usize = 1000;

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node is shutting down")]
    ShuttingDown,
}

/// A running node
pub struct Node {
    config: NodeConfig,
    network: Network,
    chain: ChainHandle,
    pool: Arc<TxPool>,
    owner: Mutex<Option<thread::JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Node {
    /// Open the chain, start the network and wire the topics.
    ///
    /// Failing to open the chain, bind the listener or reach the bootnode
    /// is fatal.
    pub async fn start(config: NodeConfig) -> Result<Arc<Node>, NodeError> {
        let (chain, owner) =
            ChainHandle::spawn(config.data_dir.clone(), config.chain.clone()).await?;

        let network = match Network::start(config.network.clone()).await {
            Ok(network) => network,
            Err(e) => {
                let _ = chain.stop().await;
                let _ = owner.join();
                return Err(e.into());
            }
        };

        let pool = Arc::new(TxPool::new());
        let (stop_tx, _) = watch::channel(false);
        let node = Arc::new(Node {
            config,
            network,
            chain,
            pool,
            owner: Mutex::new(Some(owner)),
            forwarder: Mutex::new(None),
            stop_tx,
            stopped: AtomicBool::new(false),
        });

        let pool = node.pool.clone();
        node.network.subscribe(TRANSACTION_TOPIC, move |msg: GossipMessage| {
            if let Err(e) = pool.handle_gossip(&msg.data) {
                warn!("Dropping undecodable transaction from {}: {e}", msg.source);
            }
        })?;

        let chain = node.chain.clone();
        node.network.subscribe(BLOCK_TOPIC, move |msg: GossipMessage| {
            match BlockAnnouncement::from_bytes(&msg.data) {
                Ok(announcement) => handle_announcement(&chain, &announcement),
                Err(e) => warn!("Dropping undecodable announcement from {}: {e}", msg.source),
            }
        })?;

        if let Some(outbound) = node.pool.take_outbound() {
            let forwarder = tokio::spawn(forward_transactions(
                node.network.clone(),
                outbound,
                node.stop_tx.subscribe(),
            ));
            *node.forwarder.lock() = Some(forwarder);
        }

        info!("Node {} ready", node.network.local_addr());
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn chain(&self) -> &ChainHandle {
        &self.chain
    }

    pub fn pool(&self) -> &TxPool {
        &self.pool
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.network.local_peer_id()
    }

    /// Pool a transaction and gossip it if it was new
    pub fn add_transaction(&self, tx: Transaction) -> Result<Hash, NodeError> {
        if self.is_stopped() {
            return Err(NodeError::ShuttingDown);
        }
        let hash = tx.hash()?;
        if self.pool.insert(tx.clone())? {
            self.pool.broadcast(tx);
        }
        Ok(hash)
    }

    /// Mine the pooled transactions into a block and announce it.
    ///
    /// If the attempt is cancelled or fails, the transactions go back to
    /// the pool.
    pub async fn mine_block(&self) -> Result<Block, NodeError> {
        if self.is_stopped() {
            return Err(NodeError::ShuttingDown);
        }
        let transactions = self.pool.drain(MAX_BLOCK_TRANSACTIONS);
        let block = match self
            .chain
            .add_block(transactions.clone(), CancelFlag::new())
            .await
        {
            Ok(block) => block,
            Err(e) => {
                self.pool.restore(transactions);
                return Err(e.into());
            }
        };

        let announcement = BlockAnnouncement::for_block(&block, self.local_peer_id());
        match self.network.broadcast(BLOCK_TOPIC, announcement.to_bytes()?) {
            Ok(peers) => debug!("Announced {announcement} to {peers} peers"),
            Err(e) => warn!("Failed to announce block {}: {e}", block.hash),
        }
        Ok(block)
    }

    /// Ask the process to shut down; see [`wait_for_stop`](Self::wait_for_stop)
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Resolve once a stop has been requested
    pub async fn wait_for_stop(&self) {
        stop_requested(&mut self.stop_tx.subscribe()).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop network tasks, then the chain owner, releasing the store
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.request_stop();

        self.network.shutdown().await;

        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                error!("Transaction forwarder failed: {e}");
            }
        }

        self.chain.cancel_mining();
        if let Err(e) = self.chain.stop().await {
            warn!("Chain owner did not stop cleanly: {e}");
        }
        let owner = self.owner.lock().take();
        if let Some(owner) = owner {
            let joined = tokio::task::spawn_blocking(move || owner.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                error!("Chain owner thread panicked");
            }
        }
        info!("Node stopped");
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopping| *stopping).await;
}

/// React to a block mined elsewhere
fn handle_announcement(chain: &ChainHandle, announcement: &BlockAnnouncement) {
    info!("Received {announcement}");
    if chain.cancel_if_mining(announcement.height) {
        info!("Cancelled local mining of height {}", announcement.height);
    }
}

/// Gossip locally submitted transactions until the node stops
async fn forward_transactions(
    network: Network,
    mut outbound: mpsc::UnboundedReceiver<Transaction>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = stop_requested(&mut stop) => break,
            next = outbound.recv() => next,
        };
        let Some(tx) = next else { break };

        let payload = match tx.serialize() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode transaction: {e}");
                continue;
            }
        };
        match network.broadcast(TRANSACTION_TOPIC, payload) {
            Ok(peers) => debug!("Forwarded transaction to {peers} peers"),
            Err(e) => warn!("Failed to forward transaction: {e}"),
        }
    }
    debug!("Transaction forwarder stopped");
}

//! Chain owner thread
//!
//! The Chain Manager lives on one dedicated OS thread. Everything else
//! talks to it through [`ChainHandle`] commands with oneshot replies, so
//! mining never blocks the async runtime.

use log::{error, info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

use crate::config::ChainConfig;
use crate::consensus::{Block, CancelFlag, Transaction};
use crate::crypto::Hash;
use crate::storage::{ChainError, ChainManager, StorageError};

/// Snapshot of the chain tip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStatus {
    pub head: Hash,
    pub height: u64,
    pub difficulty: u32,
}

enum ChainCommand {
    AddBlock {
        transactions: Vec<Transaction>,
        cancel: CancelFlag,
        reply: oneshot::Sender<Result<Block, ChainError>>,
    },
    Status {
        reply: oneshot::Sender<ChainStatus>,
    },
    GetBlock {
        hash: Hash,
        reply: oneshot::Sender<Result<Option<Block>, ChainError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), ChainError>>,
    },
}

/// Height and cancel flag of the block currently being mined
#[derive(Debug, Clone)]
struct MiningJob {
    height: u64,
    cancel: CancelFlag,
}

/// Cloneable handle to the chain owner thread
#[derive(Clone)]
pub struct ChainHandle {
    commands: mpsc::UnboundedSender<ChainCommand>,
    mining: Arc<Mutex<Option<MiningJob>>>,
}

impl ChainHandle {
    /// Start the owner thread and open (or initialise) the chain in `data_dir`.
    ///
    /// Resolves once the chain is ready; opening failures are returned here.
    pub async fn spawn(
        data_dir: PathBuf,
        config: ChainConfig,
    ) -> Result<(ChainHandle, JoinHandle<()>), ChainError> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mining = Arc::new(Mutex::new(None));

        let owner_mining = mining.clone();
        let thread = thread::Builder::new()
            .name("chain-owner".to_string())
            .spawn(move || {
                let chain = match ChainManager::open(&data_dir, &config) {
                    Ok(chain) => {
                        info!("{chain}");
                        let _ = ready_tx.send(Ok(()));
                        chain
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_owner(chain, receiver, owner_mining);
            })
            .map_err(|e| ChainError::Storage(StorageError::Unavailable(format!("chain owner thread: {e}"))))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok((ChainHandle { commands, mining }, thread)),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(ChainError::Stopped),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ChainCommand,
    ) -> Result<T, ChainError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| ChainError::Stopped)?;
        response.await.map_err(|_| ChainError::Stopped)
    }

    /// Mine `transactions` into the next block.
    ///
    /// Cancelled by [`cancel_if_mining`](Self::cancel_if_mining) or by `cancel`.
    pub async fn add_block(
        &self,
        transactions: Vec<Transaction>,
        cancel: CancelFlag,
    ) -> Result<Block, ChainError> {
        self.request(|reply| ChainCommand::AddBlock {
            transactions,
            cancel,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<ChainStatus, ChainError> {
        self.request(|reply| ChainCommand::Status { reply }).await
    }

    pub async fn get_block(&self, hash: Hash) -> Result<Option<Block>, ChainError> {
        self.request(|reply| ChainCommand::GetBlock { hash, reply })
            .await?
    }

    /// Release the store; the owner thread exits afterwards
    pub async fn stop(&self) -> Result<(), ChainError> {
        self.request(|reply| ChainCommand::Stop { reply }).await?
    }

    /// Height of the block being mined right now, if any
    pub fn mining_height(&self) -> Option<u64> {
        self.mining.lock().as_ref().map(|job| job.height)
    }

    /// Abandon whatever is being mined
    pub fn cancel_mining(&self) {
        if let Some(job) = self.mining.lock().as_ref() {
            job.cancel.cancel();
        }
    }

    /// Abandon the current mining attempt if it targets `height`
    pub fn cancel_if_mining(&self, height: u64) -> bool {
        match self.mining.lock().as_ref() {
            Some(job) if job.height == height => {
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

fn run_owner(
    mut chain: ChainManager,
    mut commands: mpsc::UnboundedReceiver<ChainCommand>,
    mining: Arc<Mutex<Option<MiningJob>>>,
) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            ChainCommand::AddBlock {
                transactions,
                cancel,
                reply,
            } => {
                *mining.lock() = Some(MiningJob {
                    height: chain.height(),
                    cancel: cancel.clone(),
                });
                let result = chain.append_cancellable(transactions, &cancel);
                *mining.lock() = None;

                match &result {
                    Ok(block) => info!("{chain} (+{} txs)", block.tx_count()),
                    Err(ChainError::MiningCancelled) => info!("Mining of block {} cancelled", chain.height()),
                    Err(e) => error!("Failed to append block: {e}"),
                }
                let _ = reply.send(result);
            }
            ChainCommand::Status { reply } => {
                let _ = reply.send(ChainStatus {
                    head: chain.head(),
                    height: chain.height(),
                    difficulty: chain.difficulty(),
                });
            }
            ChainCommand::GetBlock { hash, reply } => {
                let _ = reply.send(chain.get_block(&hash));
            }
            ChainCommand::Stop { reply } => {
                let _ = reply.send(chain.stop());
                break;
            }
        }
    }

    if !chain.is_stopped() {
        if let Err(e) = chain.stop() {
            warn!("Failed to close chain store: {e}");
        }
    }
    info!("Chain owner stopped");
}

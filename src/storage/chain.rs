//! Chain state manager
//!
//! Turns mined blocks into durable, ordered history. The manager is either
//! ready (holding a store handle) or stopped; construction runs Init on a
//! fresh store and Load on an existing one.
//!
//! Key layout: `state-chainhead` holds the encoded head hash,
//! `state-chainheight` the encoded height, and every other key is a block
//! hash mapping to the encoded block.
//!
//! The manager has no internal locking. Callers serialize access, normally by
//! giving one task exclusive ownership.

use log::{info, warn};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use super::db::{KvStore, SledStore, StorageError};
use crate::codec::{self, SerializationError};
use crate::config::ChainConfig;
use crate::consensus::{summarize, Block, CancelFlag, ConsensusError, ProofOfWork, Transaction};
use crate::crypto::{Address, Hash};

/// Key of the head hash entry
pub const HEAD_KEY: &[u8] = b"state-chainhead";
/// Key of the chain height entry
pub const HEIGHT_KEY: &[u8] = b"state-chainheight";

/// Chain manager errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("Nonce space {start}..={end} exhausted without a valid block")]
    ConsensusExhausted { start: u64, end: u64 },
    #[error("Mining cancelled")]
    MiningCancelled,
    #[error("Invalid difficulty {0}")]
    InvalidDifficulty(u32),
    #[error("Corrupt chain state: {0}")]
    CorruptState(String),
    #[error("Chain initialization failed: {0}")]
    Initialization(Box<ChainError>),
    #[error("Chain manager is stopped")]
    Stopped,
}

impl From<ConsensusError> for ChainError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::InvalidDifficulty(d) => ChainError::InvalidDifficulty(d),
            ConsensusError::Exhausted { start, end } => ChainError::ConsensusExhausted { start, end },
            ConsensusError::Cancelled => ChainError::MiningCancelled,
            ConsensusError::Serialization(e) => ChainError::Serialization(e),
        }
    }
}

/// Owner of the durable chain state
pub struct ChainManager<S: KvStore = SledStore> {
    store: Option<S>,
    pow: ProofOfWork,
    miner: Address,
    block_reward: u64,
    head: Hash,
    height: u64,
}

impl ChainManager<SledStore> {
    /// Open (or create) the sled database at `path`
    pub fn open<P: AsRef<Path>>(path: P, config: &ChainConfig) -> Result<Self, ChainError> {
        let path = path.as_ref();
        let fresh = !SledStore::exists(path);
        if fresh {
            info!("No chain database at {}, creating one", path.display());
        }
        let store = match SledStore::open(path) {
            Ok(store) => store,
            Err(e) if fresh => return Err(ChainError::Initialization(Box::new(e.into()))),
            Err(e) => return Err(e.into()),
        };
        Self::with_store(store, config)
    }
}

impl<S: KvStore> ChainManager<S> {
    /// Build a manager over an opened store, running Init or Load
    pub fn with_store(store: S, config: &ChainConfig) -> Result<Self, ChainError> {
        let pow = ProofOfWork::new(config.difficulty)?;
        let mut manager = Self {
            store: Some(store),
            pow,
            miner: config.miner_address,
            block_reward: config.block_reward,
            head: Hash::zero(),
            height: 0,
        };

        if manager.store()?.contains(HEAD_KEY)? {
            manager.load()?;
        } else {
            manager
                .init()
                .map_err(|e| ChainError::Initialization(Box::new(e)))?;
        }
        Ok(manager)
    }

    fn store(&self) -> Result<&S, ChainError> {
        self.store.as_ref().ok_or(ChainError::Stopped)
    }

    fn init(&mut self) -> Result<(), ChainError> {
        let genesis = Block::genesis(&self.pow, self.miner, self.block_reward, &CancelFlag::new())?;
        self.commit(&genesis, 1)?;
        self.head = genesis.hash;
        self.height = 1;
        info!("Initialized chain with genesis {}", genesis.hash);
        Ok(())
    }

    fn load(&mut self) -> Result<(), ChainError> {
        let store = self.store()?;
        let head: Hash = codec::decode(&store.get(HEAD_KEY)?)?;
        let height: u64 = match store.get(HEIGHT_KEY) {
            Ok(bytes) => codec::decode(&bytes)?,
            Err(StorageError::NotFound(_)) => {
                return Err(ChainError::CorruptState("chain height missing".to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let block = match read_block(store, &head) {
            Ok(Some(block)) => block,
            Ok(None) => {
                return Err(ChainError::CorruptState(format!("head block {head} not stored")))
            }
            Err(ChainError::Serialization(e)) => {
                return Err(ChainError::CorruptState(format!(
                    "head block {head} undecodable: {e}"
                )))
            }
            Err(e) => return Err(e),
        };
        if block.hash != head {
            return Err(ChainError::CorruptState(format!(
                "block under key {head} has hash {}",
                block.hash
            )));
        }
        if block.height + 1 != height {
            return Err(ChainError::CorruptState(format!(
                "head block height {} does not match chain height {height}",
                block.height
            )));
        }

        self.head = head;
        self.height = height;
        info!("Loaded chain: {self}");
        Ok(())
    }

    /// Persist a block, then head and height as one batch
    fn commit(&self, block: &Block, height: u64) -> Result<(), ChainError> {
        let store = self.store()?;
        store.set(block.hash.as_bytes(), &block.serialize()?)?;

        let head = codec::encode(&block.hash)?;
        let height = codec::encode(&height)?;
        store.write_batch(&[(HEAD_KEY, head.as_slice()), (HEIGHT_KEY, height.as_slice())])?;
        Ok(())
    }

    /// Mine and persist a block holding `transactions`; returns its hash
    pub fn append(&mut self, transactions: Vec<Transaction>) -> Result<Hash, ChainError> {
        self.append_cancellable(transactions, &CancelFlag::new())
            .map(|block| block.hash)
    }

    /// Like [`append`](Self::append) but abandons mining when `cancel` fires.
    ///
    /// A cancelled or failed append leaves head and height untouched.
    pub fn append_cancellable(
        &mut self,
        transactions: Vec<Transaction>,
        cancel: &CancelFlag,
    ) -> Result<Block, ChainError> {
        if self.is_stopped() {
            return Err(ChainError::Stopped);
        }
        let block = Block::new_block(&self.pow, transactions, self.head, self.height, cancel)?;
        let next_height = self.height + 1;
        self.commit(&block, next_height)?;

        self.head = block.hash;
        self.height = next_height;
        Ok(block)
    }

    /// Hash of the most recently appended block
    pub fn head(&self) -> Hash {
        self.head
    }

    /// Number of blocks in the chain; also the height of the next block
    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn difficulty(&self) -> u32 {
        self.pow.difficulty()
    }

    pub fn is_stopped(&self) -> bool {
        self.store.is_none()
    }

    /// Fetch a stored block by hash
    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        read_block(self.store()?, hash)
    }

    /// Walk the chain from head back to genesis
    pub fn blocks(&self) -> Result<Blocks<'_, S>, ChainError> {
        Ok(Blocks {
            store: self.store()?,
            next: Some(self.head),
        })
    }

    /// Re-check the stored chain: seals, summaries, linkage and heights.
    ///
    /// Returns the number of blocks verified.
    pub fn verify_chain(&self) -> Result<u64, ChainError> {
        let mut expected = self.height;
        let mut last_priori = None;

        for block in self.blocks()? {
            let block = block?;
            if expected == 0 {
                return Err(ChainError::CorruptState(format!(
                    "chain continues past genesis at {}",
                    block.hash
                )));
            }
            expected -= 1;

            if block.height != expected {
                return Err(ChainError::CorruptState(format!(
                    "block {} has height {}, expected {expected}",
                    block.hash, block.height
                )));
            }
            if !block.verify_seal() {
                return Err(ChainError::CorruptState(format!(
                    "block {} fails proof of work",
                    block.hash
                )));
            }
            if summarize(&block.transactions)? != block.header.summary {
                return Err(ChainError::CorruptState(format!(
                    "block {} summary mismatch",
                    block.hash
                )));
            }
            last_priori = Some(block.header.priori);
        }

        match last_priori {
            Some(priori) if expected == 0 && priori.is_zero() => Ok(self.height),
            _ => Err(ChainError::CorruptState(format!(
                "chain ends {expected} blocks short of genesis"
            ))),
        }
    }

    /// Release the store handle. The manager rejects every later call.
    pub fn stop(&mut self) -> Result<(), ChainError> {
        let store = self.store.take().ok_or(ChainError::Stopped)?;
        if let Err(e) = store.close() {
            warn!("Failed to flush chain store on stop: {e}");
            return Err(e.into());
        }
        info!("Chain manager stopped at {}", self.height);
        Ok(())
    }
}

impl<S: KvStore> fmt::Display for ChainManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chain Head: {} || Chain Height: {}", self.head, self.height)
    }
}

fn read_block<S: KvStore>(store: &S, hash: &Hash) -> Result<Option<Block>, ChainError> {
    match store.get(hash.as_bytes()) {
        Ok(bytes) => Ok(Some(Block::deserialize(&bytes)?)),
        Err(StorageError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Iterator from head to genesis, following `priori` links
pub struct Blocks<'a, S: KvStore> {
    store: &'a S,
    next: Option<Hash>,
}

impl<'a, S: KvStore> Iterator for Blocks<'a, S> {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match read_block(self.store, &hash) {
            Ok(Some(block)) => {
                if !block.header.priori.is_zero() {
                    self.next = Some(block.header.priori);
                }
                Some(Ok(block))
            }
            Ok(None) => Some(Err(ChainError::CorruptState(format!(
                "block {hash} referenced but not stored"
            )))),
            Err(e) => Some(Err(e)),
        }
    }
}

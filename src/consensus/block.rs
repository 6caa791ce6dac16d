//! Block structure for the Kiln ledger
//!
//! Defines the immutable block and block header structures and the
//! constructors that mine them.

use log::info;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::pow::{CancelFlag, ConsensusError, MiningOutcome, ProofOfWork};
use super::transaction::{summarize, Transaction};
use crate::codec::{self, SerializationError};
use crate::crypto::{double_hash, Address, Hash};

/// Block header: every field relevant to the block's cryptographic integrity.
///
/// Field order matters: `nonce` must remain the last field so that its bytes
/// sit at the tail of the serialized header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    /// Hash of the previous block (null for genesis)
    pub priori: Hash,
    /// Commitment over the block's transactions
    pub summary: Hash,
    /// Block creation time (seconds since Unix epoch)
    pub timestamp: i64,
    /// Proof-of-work target fixed at construction
    pub target: BigUint,
    /// Nonce used for PoW
    pub nonce: u64,
}

impl BlockHeader {
    /// Create a header stamped with the current wall-clock time
    pub fn new(priori: Hash, summary: Hash, target: BigUint) -> Self {
        Self::with_timestamp(priori, summary, unix_now(), target)
    }

    pub fn with_timestamp(priori: Hash, summary: Hash, timestamp: i64, target: BigUint) -> Self {
        Self {
            priori,
            summary,
            timestamp,
            target,
            nonce: 0,
        }
    }

    /// Copy of this header carrying a different nonce
    pub fn with_nonce(&self, nonce: u64) -> Self {
        Self {
            nonce,
            ..self.clone()
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SerializationError> {
        codec::encode(self)
    }

    /// Calculate the hash of this header
    pub fn hash(&self) -> Result<Hash, SerializationError> {
        Ok(double_hash(&self.serialize()?))
    }
}

/// A complete block containing header and transactions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Ordered transactions in this block
    pub transactions: Vec<Transaction>,
    /// Zero-based position in the chain
    pub height: u64,
    /// Hash of the mined header
    pub hash: Hash,
}

impl Block {
    /// Build and mine a block on top of `priori`.
    ///
    /// Blocks the calling thread until a nonce is found or `cancel` fires.
    pub fn new_block(
        pow: &ProofOfWork,
        transactions: Vec<Transaction>,
        priori: Hash,
        height: u64,
        cancel: &CancelFlag,
    ) -> Result<Block, ConsensusError> {
        let summary = summarize(&transactions)?;
        let template = BlockHeader::new(priori, summary, pow.target().clone());

        match ProofOfWork::mine(&template, cancel)? {
            MiningOutcome::Mined { nonce, hash } => {
                info!("Block {height}: {hash} [{nonce}]");
                Ok(Block {
                    header: template.with_nonce(nonce),
                    transactions,
                    height,
                    hash,
                })
            }
            MiningOutcome::Cancelled => Err(ConsensusError::Cancelled),
        }
    }

    /// Build the genesis block holding the single coinbase transaction
    pub fn genesis(
        pow: &ProofOfWork,
        miner: Address,
        reward: u64,
        cancel: &CancelFlag,
    ) -> Result<Block, ConsensusError> {
        Self::new_block(
            pow,
            vec![Transaction::coinbase(miner, reward)],
            Hash::zero(),
            0,
            cancel,
        )
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SerializationError> {
        codec::encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block, SerializationError> {
        codec::decode(bytes)
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.header.priori.is_zero()
    }

    /// Check that the stored hash matches the header and satisfies its target
    pub fn verify_seal(&self) -> bool {
        matches!(self.header.hash(), Ok(h) if h == self.hash) && ProofOfWork::validate(&self.header)
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=======[{}][{}]", self.height, self.header.timestamp)?;
        writeln!(f, "Block Hash: {}", self.hash)?;
        writeln!(f, "Priori Hash: {}", self.header.priori)?;
        writeln!(f, "Txn Count: {}", self.tx_count())?;
        writeln!(f, "Nonce: {}", self.header.nonce)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pow() -> ProofOfWork {
        ProofOfWork::new(8).unwrap()
    }

    fn miner() -> Address {
        Address::from_key_material(b"miner")
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(&pow(), miner(), 100, &CancelFlag::new()).unwrap();

        assert!(genesis.is_genesis());
        assert_eq!(genesis.height, 0);
        assert!(genesis.header.priori.is_zero());
        assert_eq!(genesis.transactions, vec![Transaction::coinbase(miner(), 100)]);
        assert!(genesis.verify_seal());
    }

    #[test]
    fn test_new_block_links_priori() {
        let pow = pow();
        let genesis = Block::genesis(&pow, miner(), 100, &CancelFlag::new()).unwrap();
        let tx = Transaction::new(miner(), Address::from_key_material(b"bob"), 1, 10);
        let block =
            Block::new_block(&pow, vec![tx.clone()], genesis.hash, 1, &CancelFlag::new()).unwrap();

        assert_eq!(block.header.priori, genesis.hash);
        assert_eq!(block.height, 1);
        assert_eq!(block.header.summary, summarize(&[tx]).unwrap());
        assert_eq!(block.header.target, *pow.target());
        assert!(!block.is_genesis());
        assert!(block.verify_seal());
    }

    #[test]
    fn test_block_roundtrip() {
        let block = Block::genesis(&pow(), miner(), 100, &CancelFlag::new()).unwrap();
        let bytes = block.serialize().unwrap();
        assert_eq!(Block::deserialize(&bytes).unwrap(), block);
        assert_eq!(block.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_cancelled_block() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = Block::new_block(&pow(), vec![], Hash::zero(), 0, &cancel);
        assert!(matches!(result, Err(ConsensusError::Cancelled)));
    }

    #[test]
    fn test_tampered_block_fails_seal() {
        let mut block = Block::genesis(&pow(), miner(), 100, &CancelFlag::new()).unwrap();
        block.header.timestamp += 1;
        assert!(!block.verify_seal());
    }

    #[test]
    fn test_display() {
        let block = Block::genesis(&pow(), miner(), 100, &CancelFlag::new()).unwrap();
        let text = block.to_string();
        assert!(text.contains(&block.hash.to_hex()));
        assert!(text.contains("Txn Count: 1"));
    }
}

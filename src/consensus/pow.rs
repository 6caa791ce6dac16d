//! Proof-of-work engine
//!
//! A header is valid when its double hash, read as a big-endian unsigned
//! 256-bit integer, is strictly below the header's target. The target is
//! `2^(256 - difficulty)` and is fixed when the header is built.

use log::debug;
use num_bigint::BigUint;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::BlockHeader;
use crate::codec::SerializationError;
use crate::crypto::{double_hash, Hash};

/// Highest difficulty representable by a 256-bit hash
pub const MAX_DIFFICULTY: u32 = 256;

/// Byte width of the nonce at the tail of a serialized header
const NONCE_LEN: usize = 8;

/// Consensus errors
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Difficulty {0} out of range (0..=256)")]
    InvalidDifficulty(u32),
    #[error("Nonce space {start}..={end} exhausted without a valid hash")]
    Exhausted { start: u64, end: u64 },
    #[error("Mining cancelled")]
    Cancelled,
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

/// Result of a mining attempt that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    /// Found a nonce whose header hash is below target
    Mined { nonce: u64, hash: Hash },
    /// The cancel flag fired before a solution was found
    Cancelled,
}

/// Shared cancellation signal for an in-progress mining attempt
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Proof-of-work parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty: u32,
    target: BigUint,
}

impl ProofOfWork {
    /// Create an engine for a static difficulty (number of leading zero bits)
    pub fn new(difficulty: u32) -> Result<Self, ConsensusError> {
        if difficulty > MAX_DIFFICULTY {
            return Err(ConsensusError::InvalidDifficulty(difficulty));
        }
        Ok(Self {
            difficulty,
            target: target_for(difficulty),
        })
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Target stamped into headers built under this engine
    pub fn target(&self) -> &BigUint {
        &self.target
    }

    /// Search the whole nonce space starting from 0.
    ///
    /// The template is never modified; its own nonce is ignored.
    pub fn mine(header: &BlockHeader, cancel: &CancelFlag) -> Result<MiningOutcome, ConsensusError> {
        Self::mine_range(header, 0..=u64::MAX, cancel)
    }

    /// Search an inclusive nonce range for the first valid nonce.
    pub fn mine_range(
        header: &BlockHeader,
        nonces: RangeInclusive<u64>,
        cancel: &CancelFlag,
    ) -> Result<MiningOutcome, ConsensusError> {
        let (start, end) = nonces.into_inner();
        if start > end {
            return Err(ConsensusError::Exhausted { start, end });
        }

        // Serialize once and patch the trailing nonce bytes on every attempt
        let mut data = header.serialize()?;
        let offset = data.len() - NONCE_LEN;

        let mut nonce = start;
        loop {
            if cancel.is_cancelled() {
                debug!("Mining cancelled at nonce {nonce}");
                return Ok(MiningOutcome::Cancelled);
            }

            data[offset..].copy_from_slice(&nonce.to_le_bytes());
            let hash = double_hash(&data);

            if meets_target(&hash, &header.target) {
                return Ok(MiningOutcome::Mined { nonce, hash });
            }

            if nonce == end {
                return Err(ConsensusError::Exhausted { start, end });
            }
            nonce += 1;
        }
    }

    /// Re-check a header against its own target using its current nonce
    pub fn validate(header: &BlockHeader) -> bool {
        match header.hash() {
            Ok(hash) => meets_target(&hash, &header.target),
            Err(_) => false,
        }
    }
}

/// Compute `2^(256 - difficulty)`
pub fn target_for(difficulty: u32) -> BigUint {
    BigUint::from(1u8) << (MAX_DIFFICULTY - difficulty.min(MAX_DIFFICULTY))
}

/// Interpret a hash as an unsigned big-endian integer
pub fn hash_to_int(hash: &Hash) -> BigUint {
    BigUint::from_bytes_be(hash.as_bytes())
}

/// Check `hash < target`
pub fn meets_target(hash: &Hash, target: &BigUint) -> bool {
    hash_to_int(hash) < *target
}

//! Account-model transactions
//!
//! A transaction moves `value` from one address to another. The sender nonce
//! keeps otherwise identical transfers distinct.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{self, SerializationError};
use crate::crypto::{double_hash, Address, Hash};

/// A value transfer between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Amount transferred
    pub value: u64,
    /// Sender account nonce
    pub nonce: u64,
    /// Sender address
    pub from: Address,
    /// Recipient address
    pub to: Address,
}

impl Transaction {
    /// Create a new transaction
    pub fn new(from: Address, to: Address, nonce: u64, value: u64) -> Self {
        Self {
            value,
            nonce,
            from,
            to,
        }
    }

    /// Create a coinbase transaction minting `reward` for the miner
    pub fn coinbase(miner: Address, reward: u64) -> Self {
        Self {
            value: reward,
            nonce: 0,
            from: miner,
            to: Address::null(),
        }
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.to.is_null() && self.nonce == 0
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SerializationError> {
        codec::encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SerializationError> {
        codec::decode(bytes)
    }

    /// Transaction hash: double hash of the serialized transaction
    pub fn hash(&self) -> Result<Hash, SerializationError> {
        Ok(double_hash(&self.serialize()?))
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} value={} nonce={}",
            self.from, self.to, self.value, self.nonce
        )
    }
}

/// Commitment over an ordered transaction set.
///
/// Concatenates the hash of every transaction in order and hashes the
/// result. Reordering the set changes the summary; there are no inclusion
/// proofs below whole-set granularity.
pub fn summarize(transactions: &[Transaction]) -> Result<Hash, SerializationError> {
    let mut buffer = Vec::with_capacity(transactions.len() * 32);
    for tx in transactions {
        buffer.extend_from_slice(tx.hash()?.as_bytes());
    }
    Ok(double_hash(&buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: &[u8]) -> Address {
        Address::from_key_material(tag)
    }

    #[test]
    fn test_coinbase_shape() {
        let miner = addr(b"miner");
        let tx = Transaction::coinbase(miner, 100);
        assert_eq!(tx.value, 100);
        assert_eq!(tx.nonce, 0);
        assert_eq!(tx.from, miner);
        assert!(tx.to.is_null());
        assert!(tx.is_coinbase());

        let transfer = Transaction::new(addr(b"a"), addr(b"b"), 1, 5);
        assert!(!transfer.is_coinbase());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let tx = Transaction::new(addr(b"a"), addr(b"b"), 7, 250);
        let bytes = tx.serialize().unwrap();
        assert_eq!(Transaction::deserialize(&bytes).unwrap(), tx);
    }

    #[test]
    fn test_nonce_disambiguates_hash() {
        let a = Transaction::new(addr(b"a"), addr(b"b"), 1, 10);
        let b = Transaction::new(addr(b"a"), addr(b"b"), 2, 10);
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn test_hash_is_double_hash_of_bytes() {
        let tx = Transaction::new(addr(b"a"), addr(b"b"), 1, 10);
        assert_eq!(tx.hash().unwrap(), double_hash(&tx.serialize().unwrap()));
    }

    #[test]
    fn test_summary_order_sensitive() {
        let a = Transaction::new(addr(b"a"), addr(b"b"), 1, 10);
        let b = Transaction::new(addr(b"b"), addr(b"a"), 1, 20);

        let forward = summarize(&[a.clone(), b.clone()]).unwrap();
        let reverse = summarize(&[b, a]).unwrap();
        assert_ne!(forward, reverse);
    }

    #[test]
    fn test_summary_of_concatenated_hashes() {
        let a = Transaction::new(addr(b"a"), addr(b"b"), 1, 10);
        let b = Transaction::new(addr(b"b"), addr(b"a"), 1, 20);

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&a.hash().unwrap().0);
        buffer.extend_from_slice(&b.hash().unwrap().0);
        assert_eq!(summarize(&[a, b]).unwrap(), double_hash(&buffer));
    }

    #[test]
    fn test_empty_summary_is_hash_of_nothing() {
        assert_eq!(summarize(&[]).unwrap(), double_hash(&[]));
    }
}

//! Kiln Core Library
//!
//! A minimal proof-of-work ledger: blocks of value transfers chained by
//! hash, persisted in an embedded key-value store, and gossiped between
//! nodes over a small TCP overlay with provider-record discovery.

pub mod codec;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod mempool;
pub mod node;
pub mod p2p;
pub mod rpc;
pub mod storage;

//! Storage module - key-value backends and chain state management

pub mod db;
mod chain;

pub use chain::*;
pub use db::{KvStore, MemoryStore, SledStore, StorageError};

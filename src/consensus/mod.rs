//! Consensus module - Transactions, blocks, and the proof-of-work engine

mod block;
mod pow;
mod transaction;

pub use block::*;
pub use pow::*;
pub use transaction::*;

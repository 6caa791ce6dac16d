//! Cryptography module - SHA-256 hashing, addresses, Schnorr identity keys

mod hash;
mod schnorr;

pub use hash::*;
pub use schnorr::*;

//! Block announcements gossiped on the `blockadded` topic

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{self, SerializationError};
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::p2p::PeerId;

/// A block appended by some node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnouncement {
    pub hash: Hash,
    /// Position of the announced block
    pub height: u64,
    /// Node that mined it
    pub origin: PeerId,
}

impl BlockAnnouncement {
    pub fn for_block(block: &Block, origin: PeerId) -> Self {
        Self {
            hash: block.hash,
            height: block.height,
            origin,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        codec::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        codec::decode(bytes)
    }
}

impl fmt::Display for BlockAnnouncement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {} at height {} from {}", self.hash, self.height, self.origin)
    }
}

//! P2P networking module - Peer discovery and message propagation
//!
//! A TCP overlay with signed topic gossip, provider-record discovery and
//! direct line streams.

mod dht;
mod error;
mod gossip;
mod identity;
mod network;
mod peer;
mod protocol;
mod stream;

pub use dht::{distance, key_id, nearest, Dht, PeerRecord};
pub use error::*;
pub use gossip::{GossipMessage, SeenCache, Topics, SEEN_CACHE_CAPACITY, TOPIC_CHANNEL_CAPACITY};
pub use identity::*;
pub use network::Network;
pub use peer::{Admission, PeerConnection, PeerTable};
pub use protocol::*;
pub use stream::*;

//! Peer identities and dialable addresses
//!
//! A node generates a fresh Schnorr key on every run. Its `PeerId` is the
//! SHA-256 digest of the public key, rendered in base58.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use super::NetworkError;
use crate::crypto::{hash_bytes, PrivateKey, PublicKey};

/// Separator between a socket address and a peer id in a `PeerAddr`
const P2P_SEGMENT: &str = "/p2p/";

/// 32-byte peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn from_public_key(key: &PublicKey) -> Self {
        PeerId(hash_bytes(&key.to_bytes()).0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_base58();
        write!(f, "PeerId({}..)", &text[..8.min(text.len())])
    }
}

impl FromStr for PeerId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| NetworkError::InvalidAddress(format!("bad peer id {s}: {e}")))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NetworkError::InvalidAddress(format!("peer id {s} is not 32 bytes")))?;
        Ok(PeerId(arr))
    }
}

/// Keypair of the local node
#[derive(Debug, Clone)]
pub struct Identity {
    key: PrivateKey,
    public: PublicKey,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a throwaway identity
    pub fn generate() -> Self {
        Self::from_key(PrivateKey::generate())
    }

    pub fn from_key(key: PrivateKey) -> Self {
        let public = key.public_key();
        let peer_id = PeerId::from_public_key(&public);
        Self {
            key,
            public,
            peer_id,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }
}

/// Dialable address: `ip:port` optionally followed by `/p2p/<peer-id>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub socket: SocketAddr,
    pub peer_id: Option<PeerId>,
}

impl PeerAddr {
    pub fn new(socket: SocketAddr, peer_id: Option<PeerId>) -> Self {
        Self { socket, peer_id }
    }
}

impl FromStr for PeerAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (socket, peer_id) = match s.split_once(P2P_SEGMENT) {
            Some((socket, id)) => (socket, Some(id.parse::<PeerId>()?)),
            None => (s, None),
        };
        let socket = socket
            .parse::<SocketAddr>()
            .map_err(|e| NetworkError::InvalidAddress(format!("{s}: {e}")))?;
        Ok(PeerAddr { socket, peer_id })
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_id {
            Some(id) => write!(f, "{}{P2P_SEGMENT}{id}", self.socket),
            None => write!(f, "{}", self.socket),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_derivation() {
        let identity = Identity::generate();
        assert_eq!(
            identity.peer_id(),
            PeerId::from_public_key(identity.public_key())
        );
        assert_ne!(identity.peer_id(), Identity::generate().peer_id());
    }

    #[test]
    fn test_peer_id_base58_roundtrip() {
        let id = Identity::generate().peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_plain_address() {
        let addr: PeerAddr = "127.0.0.1:1604".parse().unwrap();
        assert_eq!(addr.socket.port(), 1604);
        assert!(addr.peer_id.is_none());
        assert_eq!(addr.to_string(), "127.0.0.1:1604");
    }

    #[test]
    fn test_parse_address_with_peer_id() {
        let id = Identity::generate().peer_id();
        let text = format!("10.0.0.7:4001/p2p/{id}");
        let addr: PeerAddr = text.parse().unwrap();
        assert_eq!(addr.peer_id, Some(id));
        assert_eq!(addr.to_string(), text);
    }

    #[test]
    fn test_parse_invalid_addresses() {
        assert!(matches!(
            "not-an-address".parse::<PeerAddr>(),
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(matches!(
            "127.0.0.1:1604/p2p/0OIl".parse::<PeerAddr>(),
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(matches!(
            "127.0.0.1:1604/p2p/abc".parse::<PeerAddr>(),
            Err(NetworkError::InvalidAddress(_))
        ));
    }
}

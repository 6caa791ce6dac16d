//! P2P protocol messages
//!
//! Defines the wire messages of the overlay and the frame codec.
//! A frame is the 4-byte network magic, a little-endian `u32` payload length
//! and the bincode-encoded message.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::dht::PeerRecord;
use super::gossip::GossipMessage;
use super::{NetworkError, PeerId};
use crate::codec;
use crate::crypto::PublicKey;

/// Network magic bytes (identifies the Kiln network)
pub const NETWORK_MAGIC: [u8; 4] = [0x4B, 0x49, 0x4C, 0x4E]; // "KILN"

/// Maximum message size (4 MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// P2P message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Opening handshake, sent by both sides
    Hello(Hello),
    /// Sender joined a topic
    Subscribe(String),
    /// Sender left a topic
    Unsubscribe(String),
    /// Signed topic message
    Publish(GossipMessage),
    /// Store a provider record under a rendezvous key
    AddProvider { key: String, provider: PeerRecord },
    /// Ask for providers of a rendezvous key
    GetProviders { request_id: u64, key: String },
    /// Answer to `GetProviders`
    Providers {
        request_id: u64,
        providers: Vec<PeerRecord>,
        closer: Vec<PeerRecord>,
    },
}

/// Handshake message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    /// Protocol the connection will speak
    pub protocol: String,
    /// Sender's peer id
    pub peer_id: PeerId,
    /// Key the peer id is derived from
    pub public_key: PublicKey,
    /// Address the sender accepts connections on
    pub listen_addr: SocketAddr,
}

impl Hello {
    /// Check that the declared peer id matches the public key
    pub fn is_consistent(&self) -> bool {
        PeerId::from_public_key(&self.public_key) == self.peer_id
    }
}

impl Message {
    /// Serialize message to a frame
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        let payload = codec::encode(self)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::InvalidFrame(format!(
                "{} message of {} bytes exceeds limit",
                self.command(),
                payload.len()
            )));
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&NETWORK_MAGIC);
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Deserialize message from a complete frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        if bytes.len() < HEADER_LEN {
            return Err(NetworkError::InvalidFrame("message too short".to_string()));
        }
        let length = parse_header(&bytes[..HEADER_LEN])?;
        if bytes.len() < HEADER_LEN + length {
            return Err(NetworkError::InvalidFrame("incomplete message".to_string()));
        }
        Ok(codec::decode(&bytes[HEADER_LEN..HEADER_LEN + length])?)
    }

    /// Get the command name for this message
    pub fn command(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Subscribe(_) => "subscribe",
            Message::Unsubscribe(_) => "unsubscribe",
            Message::Publish(_) => "publish",
            Message::AddProvider { .. } => "addprovider",
            Message::GetProviders { .. } => "getproviders",
            Message::Providers { .. } => "providers",
        }
    }
}

/// Validate magic and size; returns the payload length
fn parse_header(header: &[u8]) -> Result<usize, NetworkError> {
    if header[0..4] != NETWORK_MAGIC {
        return Err(NetworkError::InvalidFrame("invalid network magic".to_string()));
    }
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(NetworkError::InvalidFrame(format!(
            "message of {length} bytes exceeds limit"
        )));
    }
    Ok(length)
}

/// Read one frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Message, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let length = parse_header(&header)?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(codec::decode(&payload)?)
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::Identity;

    fn hello() -> Hello {
        let identity = Identity::generate();
        Hello {
            protocol: "/kiln/overlay/1".to_string(),
            peer_id: identity.peer_id(),
            public_key: identity.public_key().clone(),
            listen_addr: "127.0.0.1:1604".parse().unwrap(),
        }
    }

    #[test]
    fn test_frame_layout() {
        let bytes = Message::Subscribe("transaction".to_string()).to_bytes().unwrap();
        assert_eq!(&bytes[0..4], &NETWORK_MAGIC);
        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!(length, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn test_message_from_bytes() {
        let bytes = Message::Hello(hello()).to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.command(), "hello");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = Message::Subscribe("t".to_string()).to_bytes().unwrap();
        bytes[0] = 0;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(NetworkError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut bytes = NETWORK_MAGIC.to_vec();
        bytes.extend_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_le_bytes());
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(NetworkError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let bytes = Message::Subscribe("topic".to_string()).to_bytes().unwrap();
        assert!(Message::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(Message::from_bytes(&bytes[..4]).is_err());
    }

    #[test]
    fn test_hello_consistency() {
        let mut hello = hello();
        assert!(hello.is_consistent());
        hello.peer_id = Identity::generate().peer_id();
        assert!(!hello.is_consistent());
    }

    #[tokio::test]
    async fn test_async_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = Message::GetProviders {
            request_id: 7,
            key: "join-kiln".to_string(),
        };
        write_frame(&mut client, &sent).await.unwrap();
        write_frame(&mut client, &Message::Unsubscribe("x".to_string()))
            .await
            .unwrap();

        match read_frame(&mut server).await.unwrap() {
            Message::GetProviders { request_id, key } => {
                assert_eq!(request_id, 7);
                assert_eq!(key, "join-kiln");
            }
            other => panic!("unexpected {}", other.command()),
        }
        assert_eq!(read_frame(&mut server).await.unwrap().command(), "unsubscribe");

        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(NetworkError::Io(_))
        ));
    }
}

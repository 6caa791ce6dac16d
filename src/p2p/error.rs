use thiserror::Error;

use super::PeerId;
use crate::codec::SerializationError;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Network errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Codec error: {0}")]
    Codec(#[from] SerializationError),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Network is shutting down")]
    ShuttingDown,

    #[error("Discovery failed: {0}")]
    Discovery(String),
}

//! Deterministic binary encoding
//!
//! Every persisted or hashed entity goes through bincode with its default
//! fixed-width little-endian layout, so the same value always encodes to the
//! same bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Encode/decode failure
#[derive(Debug, Error)]
#[error("Serialization error: {0}")]
pub struct SerializationError(#[from] bincode::Error);

/// Serialize a value to bytes
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SerializationError> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a value from bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_is_stable() {
        let value = (42u64, String::from("kiln"), vec![1u8, 2, 3]);
        assert_eq!(encode(&value).unwrap(), encode(&value).unwrap());
    }

    #[test]
    fn test_u64_layout_is_little_endian_fixed_width() {
        assert_eq!(encode(&1u64).unwrap(), vec![1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<(u64, String), _> = decode(&[1, 2, 3]);
        assert!(result.is_err());
    }
}

//! Node configuration
//!
//! All tunables are explicit values handed to the components that use them.
//! A node can be configured from a TOML file and CLI overrides; every field
//! has a default suitable for a local demonstration network.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::crypto::Address;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Default miner address credited by the genesis coinbase
pub const DEFAULT_MINER_ADDRESS: Address = Address([
    0x6b, 0x69, 0x6c, 0x6e, 0x2d, 0x6d, 0x69, 0x6e, 0x65, 0x72, 0x2d, 0x30, 0x30, 0x30, 0x30,
    0x30, 0x30, 0x30, 0x30, 0x31,
]);

/// Chain and consensus parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Number of leading zero bits required of a block hash
    pub difficulty: u32,
    /// Value minted by the coinbase transaction
    pub block_reward: u64,
    /// Address credited by the coinbase transaction
    #[serde(with = "hex_address")]
    pub miner_address: Address,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty: 18,
            block_reward: 100,
            miner_address: DEFAULT_MINER_ADDRESS,
        }
    }
}

/// Gossip overlay parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the overlay listener binds to (port 0 picks a free port)
    pub listen_addr: SocketAddr,
    /// Well-known peer dialed before advertising, `ip:port[/p2p/<peer-id>]`
    pub bootnode: Option<String>,
    /// Protocol identifier of overlay connections
    pub overlay_protocol: String,
    /// Protocol identifier of raw line streams
    pub stream_protocol: String,
    /// Topic joined at startup
    pub default_topic: String,
    /// Rendezvous key advertised and searched in the DHT
    pub discovery_key: String,
    /// Delay between discovery iterations
    #[serde(with = "duration_millis")]
    pub discovery_interval: Duration,
    /// Delay after bootstrapping before advertising
    #[serde(with = "duration_millis")]
    pub bootstrap_settle: Duration,
    /// Delay after advertising before the discovery loop starts
    #[serde(with = "duration_millis")]
    pub advertise_settle: Duration,
    /// Upper bound on a single DHT query or handshake
    #[serde(with = "duration_millis")]
    pub query_timeout: Duration,
    /// Lifetime of a provider record
    #[serde(with = "duration_millis")]
    pub provider_ttl: Duration,
    /// Number of peers a DHT operation contacts
    pub replication: usize,
    /// Close a direct stream after this many consecutive unreadable lines
    pub max_stream_read_errors: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 1604)),
            bootnode: None,
            overlay_protocol: "/kiln/overlay/1".to_string(),
            stream_protocol: "/kiln/stream/1".to_string(),
            default_topic: "kiln-pubsub".to_string(),
            discovery_key: "join-kiln".to_string(),
            discovery_interval: Duration::from_secs(5),
            bootstrap_settle: Duration::from_secs(1),
            advertise_settle: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
            provider_ttl: Duration::from_secs(60),
            replication: 20,
            max_stream_read_errors: None,
        }
    }
}

/// JSON-RPC server parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub listen_addr: SocketAddr,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory of the chain database
    pub data_dir: PathBuf,
    pub chain: ChainConfig,
    pub network: NetworkConfig,
    pub rpc: RpcConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            chain: ChainConfig::default(),
            network: NetworkConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse a configuration from TOML text; missing fields take defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

mod hex_address {
    use crate::crypto::Address;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(address: &Address, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&address.to_hex())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Address::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.chain.difficulty, 18);
        assert_eq!(config.network.listen_addr.port(), 1604);
        assert_eq!(config.rpc.listen_addr.port(), 8080);
        assert_eq!(config.network.discovery_interval, Duration::from_secs(5));
        assert!(config.network.max_stream_read_errors.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = r#"
            data_dir = "/tmp/kiln-a"

            [chain]
            difficulty = 12
            miner_address = "00112233445566778899aabbccddeeff00112233"

            [network]
            listen_addr = "127.0.0.1:4001"
            bootnode = "127.0.0.1:4000"
            discovery_interval = 250
        "#;
        let config = NodeConfig::from_toml_str(text).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/kiln-a"));
        assert_eq!(config.chain.difficulty, 12);
        assert_eq!(config.chain.block_reward, 100);
        assert_eq!(
            config.chain.miner_address.to_hex(),
            "00112233445566778899aabbccddeeff00112233"
        );
        assert_eq!(config.network.bootnode.as_deref(), Some("127.0.0.1:4000"));
        assert_eq!(config.network.discovery_interval, Duration::from_millis(250));
        assert_eq!(config.network.default_topic, "kiln-pubsub");
    }

    #[test]
    fn test_bad_miner_address_rejected() {
        let text = r#"
            [chain]
            miner_address = "zz"
        "#;
        assert!(NodeConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            NodeConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}

//! Kiln Node
//!
//! Main entry point for running a Kiln node.

use clap::Parser;
use kiln_core::config::NodeConfig;
use kiln_core::node::Node;
use kiln_core::p2p::PeerAddr;
use kiln_core::rpc::start_rpc_server;
use log::{error, info, warn, LevelFilter};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;

/// Proof-of-work ledger node with gossip networking
#[derive(Debug, Parser)]
#[command(name = "kiln-node", version)]
struct Opt {
    /// Overlay listen port [default: 1604]
    #[arg(long)]
    port: Option<u16>,

    /// JSON-RPC listen port [default: 8080]
    #[arg(long = "rpc-port")]
    rpc_port: Option<u16>,

    /// Listen ip for the overlay and the RPC server [default: 0.0.0.0]
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Bootnode address (`ip:port/p2p/<peer-id>`); unreachable is fatal
    #[arg(long)]
    bootnode: Option<String>,

    /// Peer to connect to right after startup
    #[arg(long)]
    peer: Option<String>,

    /// Chain database directory
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Leading zero bits required of block hashes
    #[arg(long)]
    difficulty: Option<u32>,
}

impl Opt {
    fn node_config(&self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        config.network.listen_addr = self.listen_addr(config.network.listen_addr, self.port);
        config.rpc.listen_addr = self.listen_addr(config.rpc.listen_addr, self.rpc_port);
        if let Some(bootnode) = &self.bootnode {
            config.network.bootnode = Some(bootnode.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(difficulty) = self.difficulty {
            config.chain.difficulty = difficulty;
        }
        Ok(config)
    }

    /// Replace only the parts of `configured` given on the command line
    fn listen_addr(&self, configured: SocketAddr, port: Option<u16>) -> SocketAddr {
        SocketAddr::new(
            self.ip.unwrap_or(configured.ip()),
            port.unwrap_or(configured.port()),
        )
    }
}

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    if let Err(e) = run(opt).await {
        error!("Error: {e}");
        process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let config = opt.node_config()?;
    let rpc_addr = config.rpc.listen_addr;
    let node = Node::start(config).await?;

    if let Some(peer) = &opt.peer {
        let addr: PeerAddr = peer.parse()?;
        match node.network().connect(addr).await {
            Ok(id) => info!("Connected to peer {id}"),
            Err(e) => warn!("Failed to connect to {addr}: {e}"),
        }
    }

    let rpc_node = node.clone();
    let rpc = tokio::spawn(async move {
        if let Err(e) = start_rpc_server(rpc_node.clone(), rpc_addr).await {
            error!("RPC server failed: {e}");
            rpc_node.request_stop();
        }
    });

    info!("Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = node.wait_for_stop() => info!("Stop requested"),
    }

    node.shutdown().await;
    if let Err(e) = rpc.await {
        error!("RPC task failed: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[network]\nlisten_addr = \"127.0.0.1:4000\"\n\n[rpc]\nlisten_addr = \"127.0.0.1:4001\""
        )
        .unwrap();
        file
    }

    #[test]
    fn test_config_file_listen_addrs_survive() {
        let file = config_file();
        let path = file.path().to_str().unwrap();
        let config = Opt::parse_from(["kiln-node", "--config", path]).node_config().unwrap();
        assert_eq!(config.network.listen_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.rpc.listen_addr, "127.0.0.1:4001".parse().unwrap());
    }

    #[test]
    fn test_flags_override_only_what_they_name() {
        let file = config_file();
        let path = file.path().to_str().unwrap();
        let config = Opt::parse_from(["kiln-node", "--config", path, "--port", "5000"])
            .node_config()
            .unwrap();
        assert_eq!(config.network.listen_addr, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.rpc.listen_addr, "127.0.0.1:4001".parse().unwrap());

        let config = Opt::parse_from(["kiln-node", "--config", path, "--ip", "10.0.0.7"])
            .node_config()
            .unwrap();
        assert_eq!(config.network.listen_addr, "10.0.0.7:4000".parse().unwrap());
        assert_eq!(config.rpc.listen_addr, "10.0.0.7:4001".parse().unwrap());
    }

    #[test]
    fn test_defaults_without_config() {
        let config = Opt::parse_from(["kiln-node", "--rpc-port", "9000"]).node_config().unwrap();
        assert_eq!(config.network.listen_addr, "0.0.0.0:1604".parse().unwrap());
        assert_eq!(config.rpc.listen_addr, "0.0.0.0:9000".parse().unwrap());
    }
}

//! CLI commands for the node
//!
//! Implements the command handlers behind `main`.

use crate::chain::{BlockHash, BlockHeader};
use crate::network::{NetworkParams, Node, NodeConfig};
use crate::storage::{FileStore, NetworkStore};
use crate::wire::Decodable;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Default data directory
pub const DEFAULT_DATA_DIR: &str = ".chainpeer";

/// Options for `start`; unset values fall back to the config file, then defaults
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub network: Option<String>,
    /// Comma-separated peer list
    pub peers: Option<String>,
    pub dns_seeds: bool,
    pub external_ip: Option<String>,
    pub exclude_hashes: Vec<String>,
    pub no_listen: bool,
    pub max_outbound: Option<usize>,
}

/// Merge command-line options over the config file
pub fn node_config(opts: &StartOptions) -> CliResult<NodeConfig> {
    let mut config = match &opts.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            ..Default::default()
        },
    };

    if let Some(name) = &opts.network {
        config.network = NetworkParams::by_name(name)
            .ok_or_else(|| format!("unknown network '{}' (expected bch or btc)", name))?;
    }
    if let Some(dir) = &opts.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(port) = opts.port {
        config.port = port;
    }
    if let Some(peers) = &opts.peers {
        config.bootstrap_peers.extend(
            peers
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        );
    }
    if opts.dns_seeds {
        config.dns_seeds = config.network.dns_seeds.clone();
    }
    if let Some(ip) = &opts.external_ip {
        config.external_address = Some(ip.clone());
    }
    for hex in &opts.exclude_hashes {
        let hash = BlockHash::from_hex(hex)?;
        if !config.network.excluded_hashes.contains(&hash) {
            config.network.excluded_hashes.push(hash);
        }
    }
    if opts.no_listen {
        config.listen = false;
    }
    if let Some(max) = opts.max_outbound {
        config.max_outbound = max;
    }

    config.validate()?;
    Ok(config)
}

fn open_store(data_dir: &Path) -> CliResult<FileStore> {
    Ok(FileStore::open(data_dir)?)
}

/// Run a node until Ctrl+C
pub async fn cmd_start(config: NodeConfig) -> CliResult<()> {
    let store: Arc<dyn NetworkStore> = Arc::new(open_store(&config.data_dir)?);

    println!(
        "🌐 Starting {} node on port {}...",
        config.network.name, config.port
    );
    let node = Arc::new(Node::new(config, store).await?);

    // Handle Ctrl+C
    let signal_node = Arc::clone(&node);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        println!("\n📴 Shutting down node...");
        signal_node.shutdown();
    });

    node.start().await?;

    let status = node.status().await;
    println!("   └─ Stopped at height {} ({})", status.height, status.tip);
    Ok(())
}

/// Show stored sync state
pub fn cmd_info(data_dir: &Path) -> CliResult<()> {
    let store = open_store(data_dir)?;
    let headers = store.load_headers()?;
    let addresses = store.load_addresses()?;

    println!("⛓️  Node data in {:?}", data_dir);
    match headers.last() {
        Some(tip) => {
            println!("   ├─ Height: {}", tip.height);
            println!("   ├─ Tip: {}", tip.hash);
        }
        None => println!("   ├─ Height: 0 (no headers synced)"),
    }
    println!("   └─ Known addresses: {}", addresses.len());
    Ok(())
}

/// List the most recent stored headers
pub fn cmd_headers(data_dir: &Path, count: usize) -> CliResult<()> {
    let store = open_store(data_dir)?;
    let headers = store.load_headers()?;
    let start = headers.len().saturating_sub(count);

    println!("🧱 Recent headers:");
    for record in headers[start..].iter().rev() {
        let time = chrono::DateTime::from_timestamp(record.header.timestamp as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("   #{} | {} | {}", record.height, record.hash, time);
    }
    Ok(())
}

/// List the freshest stored peer addresses
pub fn cmd_peers(data_dir: &Path, count: usize) -> CliResult<()> {
    let store = open_store(data_dir)?;
    let mut entries = store.load_addresses()?;
    entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

    println!("👥 Known peers ({} total):", entries.len());
    for entry in entries.iter().take(count) {
        let seen = chrono::DateTime::from_timestamp(entry.last_seen, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "   {} | services {:#x} | seen {}",
            entry.address,
            entry.address.services.bits(),
            seen
        );
    }
    Ok(())
}

/// Print the hash of a raw 80-byte header given as hex
pub fn cmd_header_hash(hex_header: &str) -> CliResult<BlockHash> {
    let bytes = hex::decode(hex_header.trim())?;
    let header = BlockHeader::from_bytes(&bytes)?;
    let hash = header.hash();
    println!("{}", hash);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::header::tests::{GENESIS_HASH, GENESIS_HEADER_HEX};

    #[test]
    fn test_node_config_from_options() {
        let opts = StartOptions {
            port: Some(18333),
            network: Some("btc".to_string()),
            peers: Some("10.0.0.1, 10.0.0.2:8334,".to_string()),
            exclude_hashes: vec![GENESIS_HASH.to_string()],
            no_listen: true,
            dns_seeds: true,
            ..Default::default()
        };

        let config = node_config(&opts).unwrap();
        assert_eq!(config.port, 18333);
        assert_eq!(config.network.magic, 0xf9beb4d9);
        assert_eq!(config.bootstrap_peers, vec!["10.0.0.1", "10.0.0.2:8334"]);
        assert_eq!(config.network.excluded_hashes.len(), 1);
        assert_eq!(config.dns_seeds, config.network.dns_seeds);
        assert!(!config.listen);
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn test_unknown_network_rejected() {
        let opts = StartOptions {
            network: Some("doge".to_string()),
            ..Default::default()
        };
        assert!(node_config(&opts).is_err());

        let opts = StartOptions {
            exclude_hashes: vec!["not-hex".to_string()],
            ..Default::default()
        };
        assert!(node_config(&opts).is_err());
    }

    #[test]
    fn test_header_hash() {
        let hash = cmd_header_hash(GENESIS_HEADER_HEX).unwrap();
        assert_eq!(hash.to_string(), GENESIS_HASH);
        assert!(cmd_header_hash("00ff").is_err());
    }

    #[test]
    fn test_read_commands_on_empty_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        cmd_info(temp_dir.path()).unwrap();
        cmd_headers(temp_dir.path(), 10).unwrap();
        cmd_peers(temp_dir.path(), 10).unwrap();
    }
}

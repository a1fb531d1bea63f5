//! P2P Node implementation
//!
//! Wires configuration, persistence and the peer manager together and
//! keeps outbound connections topped up until shutdown.

use crate::chain::BlockHash;
use crate::network::discovery::{resolve_external_address, resolve_seeds};
use crate::network::manager::PeerManager;
use crate::network::params::{NetworkParams, PeerTimings};
use crate::storage::NetworkStore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

/// How long shutdown waits for connections to close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// P2P Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port to listen on
    pub port: u16,
    /// Accept inbound connections
    pub listen: bool,
    /// Peers to keep connected
    pub bootstrap_peers: Vec<String>,
    /// DNS seeds resolved at startup
    pub dns_seeds: Vec<String>,
    /// Data directory for peers and headers
    pub data_dir: PathBuf,
    pub network: NetworkParams,
    pub timings: PeerTimings,
    /// Our public address, if known
    pub external_address: Option<String>,
    pub max_outbound: usize,
    pub reconnect_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 8333,
            listen: true,
            bootstrap_peers: Vec::new(),
            dns_seeds: Vec::new(),
            data_dir: PathBuf::from(".chainpeer"),
            network: NetworkParams::default(),
            timings: PeerTimings::default(),
            external_address: None,
            max_outbound: 8,
            reconnect_interval_secs: 60,
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "reconnect_interval_secs must be positive".to_string(),
            ));
        }
        if self.timings.verack_timeout_secs == 0 || self.timings.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

/// Node status summary
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub network: String,
    pub listening: Option<SocketAddr>,
    pub height: u32,
    pub tip: BlockHash,
    pub peers: usize,
    pub outbound: usize,
    pub known_addresses: usize,
}

/// The main P2P node
pub struct Node {
    pub config: NodeConfig,
    pub peer_manager: Arc<PeerManager>,
    listening: RwLock<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Create a node and restore persisted state
    pub async fn new(
        config: NodeConfig,
        store: Arc<dyn NetworkStore>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        config.validate()?;

        let self_address = match &config.external_address {
            Some(input) => {
                let address = resolve_external_address(input, config.port).await?;
                log::info!("External address: {}", address);
                Some(address)
            }
            None => None,
        };

        let peer_manager =
            PeerManager::new(&config.network, config.timings, self_address, store);
        let (height, addresses) = peer_manager.restore_from_store().await?;
        log::info!(
            "Node ready on {} at height {} with {} known addresses",
            config.network.name,
            height,
            addresses
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            peer_manager,
            listening: RwLock::new(None),
            shutdown_tx,
        })
    }

    /// Start the node and run until `shutdown`
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if !self.config.dns_seeds.is_empty() {
            let seeds =
                resolve_seeds(&self.config.dns_seeds, self.config.network.default_port).await;
            self.peer_manager.add_addresses(&seeds).await;
        }

        let listen_port = self.config.listen.then_some(self.config.port);
        let configured = self
            .peer_manager
            .configure(&self.config.bootstrap_peers, listen_port)
            .await?;
        log::info!("{} bootstrap peers configured", configured);

        // Bind failure aborts startup
        let local = self.peer_manager.start_listening().await?;
        *self.listening.write().await = local;
        if let Some(addr) = local {
            log::info!("Node started on {}", addr);
        }

        self.maintain_connections().await;

        let period = self.config.reconnect_interval();
        let mut reconnect = tokio::time::interval_at(Instant::now() + period, period);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = reconnect.tick() => {
                    self.maintain_connections().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        log::info!("Node shutting down...");
                        break;
                    }
                }
            }
        }

        self.peer_manager.shutdown().await;
        *self.listening.write().await = None;
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.peer_manager.outbound_count().await > 0 || self.peer_manager.peer_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        Ok(())
    }

    /// Re-dial configured peers and top up from the address book
    async fn maintain_connections(&self) {
        let redialed = self.peer_manager.connect_outbound().await;
        let active = self.peer_manager.outbound_count().await;
        let wanted = self.config.max_outbound.saturating_sub(active);
        let topped_up = self.peer_manager.connect_candidates(wanted).await;
        if redialed + topped_up > 0 {
            log::debug!(
                "Dialling {} configured and {} discovered peers",
                redialed,
                topped_up
            );
        }
    }

    /// Get node status
    pub async fn status(&self) -> NodeStatus {
        let tip = self.peer_manager.tip().await;
        NodeStatus {
            network: self.config.network.name.clone(),
            listening: *self.listening.read().await,
            height: tip.height,
            tip: tip.hash,
            peers: self.peer_manager.peer_count().await,
            outbound: self.peer_manager.outbound_count().await,
            known_addresses: self.peer_manager.address_book_snapshot().await.len(),
        }
    }

    /// Shutdown the node
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

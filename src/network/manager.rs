//! Peer manager
//!
//! Owns the peer table, the address book and the header chain. Connection
//! tasks report back through the `PeerDelegate` impl below; the manager
//! reaches a running connection only through its `PeerHandle`.

use crate::chain::{BlockHash, BlockHeader, ChainError, ChainTip, HeaderChain, HeaderRecord};
use crate::network::addrbook::{AddressBook, AddressBookEntry};
use crate::network::connection::{run_peer, PeerContext, PeerDelegate};
use crate::network::events::{EventBus, NetworkUpdate, Severity, UpdateKind};
use crate::network::params::{NetworkParams, PeerTimings};
use crate::network::peer::{
    ConnectionDirection, DisconnectReason, PeerError, PeerHandle, PeerInfo, PeerPhase,
    SessionConfig,
};
use crate::network::transport::{self, Listener, PeerStream};
use crate::storage::{NetworkStore, StorageError};
use crate::wire::{NetworkAddress, TimestampedAddress};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Maximum inbound connections
pub const MAX_INBOUND: usize = 117;

/// Commands buffered per connection
const PEER_COMMAND_QUEUE: usize = 32;

/// Back-off after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Manages all peer connections
pub struct PeerManager {
    ctx: Arc<PeerContext>,
    default_port: u16,
    self_address: Option<NetworkAddress>,
    outbound: RwLock<Vec<NetworkAddress>>,
    listen_port: RwLock<Option<u16>>,
    peers: RwLock<HashMap<SocketAddr, PeerInfo>>,
    handles: RwLock<HashMap<SocketAddr, PeerHandle>>,
    address_book: RwLock<AddressBook>,
    chain: RwLock<HeaderChain>,
    store: Arc<dyn NetworkStore>,
    events: EventBus,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    pub fn new(
        params: &NetworkParams,
        timings: PeerTimings,
        self_address: Option<NetworkAddress>,
        store: Arc<dyn NetworkStore>,
    ) -> Arc<Self> {
        let session = Arc::new(SessionConfig::new(params, &timings, self_address));
        let ctx = Arc::new(PeerContext {
            magic: params.magic,
            session,
            timings,
        });
        let chain = HeaderChain::new(params.genesis_hash, params.excluded_hashes.iter().copied());

        Arc::new(Self {
            ctx,
            default_port: params.default_port,
            self_address,
            outbound: RwLock::new(Vec::new()),
            listen_port: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            address_book: RwLock::new(AddressBook::new(self_address)),
            chain: RwLock::new(chain),
            store,
            events: EventBus::default(),
            listener: Mutex::new(None),
        })
    }

    /// Load persisted headers and addresses; returns (height, address count)
    pub async fn restore_from_store(&self) -> Result<(u32, usize), StorageError> {
        let records = self.store.load_headers()?;
        let loaded = records.len();
        let height = {
            let mut chain = self.chain.write().await;
            let restored = chain.restore(records);
            if restored < loaded {
                log::warn!(
                    "Discarding {} stored headers that do not link",
                    loaded - restored
                );
                self.store.reset_headers(chain.records())?;
            }
            chain.height()
        };

        let entries = self.store.load_addresses()?;
        let addresses = self.address_book.write().await.restore(entries);

        log::info!(
            "Restored {} headers and {} addresses",
            height,
            addresses
        );
        Ok((height, addresses))
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Set the outbound peer list and listen port
    ///
    /// Accepts `a.b.c.d`, `a.b.c.d:port`, bare IPv6 and `[v6]:port`; a
    /// missing port means the network's default. Returns the number of
    /// distinct outbound peers.
    pub async fn configure(
        &self,
        addresses: &[String],
        listen_port: Option<u16>,
    ) -> Result<usize, PeerError> {
        let mut parsed: Vec<NetworkAddress> = Vec::with_capacity(addresses.len());
        for input in addresses {
            let address = NetworkAddress::parse(input, self.default_port)
                .map_err(|e| PeerError::InvalidAddress(format!("{}: {}", input, e)))?;
            if self.self_address == Some(address) {
                log::warn!("Skipping own address {}", address);
                continue;
            }
            if !parsed.contains(&address) {
                parsed.push(address);
            }
        }

        {
            let mut peers = self.peers.write().await;
            for address in &parsed {
                let addr = address.to_socket_addr();
                peers
                    .entry(addr)
                    .or_insert_with(|| PeerInfo::new(addr, ConnectionDirection::Outbound));
            }
        }

        let count = parsed.len();
        *self.outbound.write().await = parsed;
        *self.listen_port.write().await = listen_port;
        Ok(count)
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Bind the configured listen port and start accepting
    ///
    /// Returns `Ok(None)` when no port is configured. A bind failure is
    /// returned to the caller, since the node cannot serve inbound peers.
    pub async fn start_listening(self: &Arc<Self>) -> Result<Option<SocketAddr>, PeerError> {
        let port = match *self.listen_port.read().await {
            Some(port) => port,
            None => return Ok(None),
        };

        let listener = Listener::bind(port).await?;
        let local_addr = listener.local_addr();
        self.events
            .publish(None, UpdateKind::Listening(local_addr), Severity::Info);

        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(self)));
        if let Some(previous) = self.listener.lock().await.replace(task) {
            previous.abort();
        }
        Ok(Some(local_addr))
    }

    pub async fn stop_listening(&self) {
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
    }

    async fn accept_inbound<S: PeerStream>(self: &Arc<Self>, stream: S, addr: SocketAddr) {
        let info = {
            let mut peers = self.peers.write().await;
            let inbound = peers
                .values()
                .filter(|p| p.direction == ConnectionDirection::Inbound && p.is_active())
                .count();
            if inbound >= MAX_INBOUND {
                log::warn!("Rejecting {}: {}", addr, PeerError::MaxPeersReached);
                return;
            }

            let mut info = PeerInfo::new(addr, ConnectionDirection::Inbound);
            info.phase = PeerPhase::Connecting;
            info.attempts = 1;
            info.last_attempt = Some(unix_now());
            peers.insert(addr, info.clone());
            info
        };

        log::info!("Incoming connection from {}", addr);
        tokio::spawn(Arc::clone(self).run_connection(stream, info));
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Dial every configured outbound peer that is not already connected
    ///
    /// Each attempt runs in its own task; failures are reported through
    /// events and left for the caller to retry.
    pub async fn connect_outbound(self: &Arc<Self>) -> usize {
        let targets = self.outbound.read().await.clone();
        let mut started = 0;
        for address in targets {
            if self.connect_to(address).await {
                started += 1;
            }
        }
        started
    }

    /// Dial up to `max` addresses from the address book
    pub async fn connect_candidates(self: &Arc<Self>, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        let exclude: HashSet<SocketAddr> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| p.is_active())
            .map(|p| p.addr)
            .collect();
        let candidates = self.address_book.read().await.candidates(&exclude, max);

        let mut started = 0;
        for address in candidates {
            if self.connect_to(address).await {
                started += 1;
            }
        }
        started
    }

    /// Start one connection attempt; false if the peer is already active
    pub async fn connect_to(self: &Arc<Self>, address: NetworkAddress) -> bool {
        if self.self_address == Some(address) {
            return false;
        }
        let addr = address.to_socket_addr();

        let info = {
            let mut peers = self.peers.write().await;
            let slot = peers
                .entry(addr)
                .or_insert_with(|| PeerInfo::new(addr, ConnectionDirection::Outbound));
            if slot.is_active() {
                return false;
            }
            slot.direction = ConnectionDirection::Outbound;
            slot.phase = PeerPhase::Connecting;
            slot.attempts += 1;
            slot.last_attempt = Some(unix_now());
            slot.clone()
        };
        self.events
            .publish(Some(addr), UpdateKind::Connecting, Severity::Debug);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let timeout = manager.ctx.timings.connect_timeout();
            match transport::connect(addr, timeout).await {
                Ok(stream) => {
                    manager.run_connection(stream, info).await;
                }
                Err(e) => {
                    let mut info = info;
                    info.phase = PeerPhase::Disconnected;
                    info.failures.connect += 1;
                    manager.peer_failed_to_connect(&info, &e).await;
                }
            }
        });
        true
    }

    /// Register a handle and drive the connection to completion
    async fn run_connection<S: PeerStream>(self: Arc<Self>, stream: S, info: PeerInfo) -> PeerInfo {
        let addr = info.addr;
        let (tx, rx) = mpsc::channel(PEER_COMMAND_QUEUE);
        self.handles
            .write()
            .await
            .insert(addr, PeerHandle { addr, tx });

        let ctx = Arc::clone(&self.ctx);
        let delegate: Arc<dyn PeerDelegate> = self;
        run_peer(stream, info, ctx, delegate, rx).await
    }

    /// Ask every running connection to close
    pub async fn disconnect_all(&self) {
        let handles: Vec<PeerHandle> = self.handles.read().await.values().cloned().collect();
        for handle in handles {
            handle.disconnect().await;
        }
    }

    pub async fn shutdown(&self) {
        self.stop_listening().await;
        self.disconnect_all().await;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Every known peer slot, ordered by address
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.read().await.values().cloned().collect();
        peers.sort_by_key(|p| p.addr);
        peers
    }

    pub async fn get_peer_info(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        self.peers.read().await.get(addr).cloned()
    }

    /// Peers that completed the handshake
    pub async fn peer_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.phase == PeerPhase::Handshaked)
            .count()
    }

    /// Outbound peers connecting or connected
    pub async fn outbound_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.direction == ConnectionDirection::Outbound && p.is_active())
            .count()
    }

    pub async fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.peers
            .read()
            .await
            .get(addr)
            .map_or(false, |p| p.is_active())
    }

    pub async fn outbound_targets(&self) -> Vec<NetworkAddress> {
        self.outbound.read().await.clone()
    }

    pub async fn tip(&self) -> ChainTip {
        self.chain.read().await.chain_tip()
    }

    /// Accepted headers from `height` on, at most `count`
    pub async fn headers_from(&self, height: u32, count: usize) -> Vec<HeaderRecord> {
        let chain = self.chain.read().await;
        (height.max(1)..=chain.height())
            .take(count)
            .filter_map(|h| chain.get_by_height(h).copied())
            .collect()
    }

    pub async fn address_book_snapshot(&self) -> Vec<AddressBookEntry> {
        self.address_book.read().await.snapshot()
    }

    /// Seed the address book (DNS seeds, configured peers)
    pub async fn add_addresses(&self, addresses: &[NetworkAddress]) -> usize {
        let now = unix_now();
        let mut book = self.address_book.write().await;
        let added = addresses.iter().filter(|a| book.add(**a, now)).count();
        if added > 0 {
            self.persist_addresses(&book);
        }
        added
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkUpdate> {
        self.events.subscribe()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn update_peer(&self, info: &PeerInfo) {
        if let Some(slot) = self.peers.write().await.get_mut(&info.addr) {
            *slot = info.clone();
        }
    }

    fn persist_addresses(&self, book: &AddressBook) {
        if let Err(e) = self.store.addresses_changed(&book.snapshot()) {
            log::error!("Failed to save addresses: {}", e);
        }
    }
}

async fn accept_loop(listener: Listener, manager: Weak<PeerManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.accept_inbound(stream, addr).await;
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl PeerDelegate for PeerManager {
    async fn peer_connected(&self, info: &PeerInfo) {
        self.update_peer(info).await;

        if info.direction == ConnectionDirection::Outbound {
            let address = NetworkAddress::from(info.addr).with_services(info.services);
            let mut book = self.address_book.write().await;
            if book.add(address, unix_now()) {
                self.persist_addresses(&book);
            }
        }

        self.events.publish(
            Some(info.addr),
            UpdateKind::Connected {
                user_agent: info.user_agent.clone(),
                start_height: info.start_height,
            },
            Severity::Info,
        );
    }

    async fn peer_disconnected(&self, info: &PeerInfo, reason: &DisconnectReason) {
        self.handles.write().await.remove(&info.addr);
        {
            let mut peers = self.peers.write().await;
            if info.direction == ConnectionDirection::Inbound {
                peers.remove(&info.addr);
            } else if let Some(slot) = peers.get_mut(&info.addr) {
                *slot = info.clone();
            }
        }

        let level = match reason {
            DisconnectReason::Requested | DisconnectReason::RemoteClosed => Severity::Info,
            _ => Severity::Warning,
        };
        self.events.publish(
            Some(info.addr),
            UpdateKind::Disconnected {
                reason: reason.to_string(),
            },
            level,
        );
    }

    async fn peer_failed_to_connect(&self, info: &PeerInfo, error: &PeerError) {
        self.update_peer(info).await;
        self.events.publish(
            Some(info.addr),
            UpdateKind::FailedToConnect {
                error: error.to_string(),
            },
            Severity::Warning,
        );
    }

    async fn peer_failed_handshake(&self, info: &PeerInfo) {
        self.update_peer(info).await;
        self.events
            .publish(Some(info.addr), UpdateKind::FailedHandshake, Severity::Warning);
    }

    async fn peer_failed_ping(&self, info: &PeerInfo, consecutive: u32) {
        self.update_peer(info).await;
        self.events.publish(
            Some(info.addr),
            UpdateKind::FailedPing { consecutive },
            Severity::Warning,
        );
    }

    async fn peer_failed_getaddr(&self, info: &PeerInfo) {
        self.update_peer(info).await;
        self.events
            .publish(Some(info.addr), UpdateKind::FailedGetAddr, Severity::Debug);
    }

    async fn peer_failed_getheaders(&self, info: &PeerInfo) {
        self.update_peer(info).await;
        self.events
            .publish(Some(info.addr), UpdateKind::FailedGetHeaders, Severity::Warning);
    }

    async fn received_addresses(&self, info: &PeerInfo, entries: Vec<TimestampedAddress>) {
        let received = entries.len();
        let added = {
            let mut book = self.address_book.write().await;
            let added = book.merge(&entries, Some((info.addr, info.services)), unix_now());
            if added > 0 {
                self.persist_addresses(&book);
            }
            added
        };

        self.events.publish(
            Some(info.addr),
            UpdateKind::ReceivedAddresses { received, added },
            Severity::Debug,
        );
    }

    async fn received_headers(
        &self,
        info: &PeerInfo,
        headers: Vec<BlockHeader>,
    ) -> Result<Vec<HeaderRecord>, ChainError> {
        let result = {
            let mut chain = self.chain.write().await;
            let result = chain.append(&headers);
            // Saved under the chain lock so records land in chain order
            if let Ok(records) = &result {
                if let Err(e) = self.store.headers_changed(records) {
                    log::error!("Failed to save headers: {}", e);
                }
            }
            result.map(|records| (records, chain.height()))
        };

        match result {
            Ok((records, height)) => {
                if !records.is_empty() {
                    self.events.publish(
                        Some(info.addr),
                        UpdateKind::ReceivedHeaders {
                            accepted: records.len(),
                            height,
                        },
                        Severity::Info,
                    );
                }
                Ok(records)
            }
            Err(e) => {
                self.events.publish(
                    Some(info.addr),
                    UpdateKind::RejectedHeaders {
                        reason: e.to_string(),
                    },
                    Severity::Debug,
                );
                Err(e)
            }
        }
    }

    async fn request_current_tip(&self) -> ChainTip {
        self.chain.read().await.chain_tip()
    }

    async fn known_addresses(&self, max: usize) -> Vec<TimestampedAddress> {
        self.address_book.read().await.sample(max)
    }

    async fn headers_after(
        &self,
        locators: &[BlockHash],
        stop: &BlockHash,
        max: usize,
    ) -> Vec<BlockHeader> {
        self.chain.read().await.headers_after(locators, stop, max)
    }
}

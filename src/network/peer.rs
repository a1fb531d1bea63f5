//! Per-peer protocol state
//!
//! `PeerSession` holds everything one connection knows about the handshake,
//! keepalive, address discovery and header sync. It performs no I/O: each
//! input (a decoded message or a timer firing) returns the `PeerAction`s
//! the connection task should carry out.

use crate::chain::{BlockHash, BlockHeader};
use crate::network::addrbook::filter_fresh;
use crate::network::params::{NetworkParams, PeerTimings};
use crate::wire::{
    GetHeadersMessage, Message, NetworkAddress, ServiceFlags, TimestampedAddress, VersionMessage,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Max peers reached")]
    MaxPeersReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Disconnected,
    Connecting,
    /// Version sent, waiting for verack
    AwaitingVerack,
    Handshaked,
    Disconnecting,
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerPhase::Disconnected => "disconnected",
            PeerPhase::Connecting => "connecting",
            PeerPhase::AwaitingVerack => "awaiting-verack",
            PeerPhase::Handshaked => "handshaked",
            PeerPhase::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Failure counts per protocol phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounters {
    pub connect: u32,
    pub verack: u32,
    pub ping: u32,
    pub getaddr: u32,
    pub getheaders: u32,
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    VerackTimeout,
    PingTimeout,
    RemoteClosed,
    ReadError(String),
    WriteFailed,
    Requested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::VerackTimeout => write!(f, "verack timeout"),
            DisconnectReason::PingTimeout => write!(f, "ping timeout"),
            DisconnectReason::RemoteClosed => write!(f, "closed by remote"),
            DisconnectReason::ReadError(e) => write!(f, "read error: {}", e),
            DisconnectReason::WriteFailed => write!(f, "write failed"),
            DisconnectReason::Requested => write!(f, "requested"),
        }
    }
}

/// What we know about a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub direction: ConnectionDirection,
    pub phase: PeerPhase,
    /// Negotiated from their `version`
    pub protocol_version: Option<i32>,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: Option<bool>,
    pub attempts: u32,
    /// Unix seconds
    pub last_attempt: Option<i64>,
    /// Unix seconds of the last completed handshake
    pub last_success: Option<i64>,
    pub failures: FailureCounters,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, direction: ConnectionDirection) -> Self {
        Self {
            addr,
            direction,
            phase: PeerPhase::Disconnected,
            protocol_version: None,
            services: ServiceFlags::empty(),
            user_agent: String::new(),
            start_height: 0,
            relay: None,
            attempts: 0,
            last_attempt: None,
            last_success: None,
            failures: FailureCounters::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            PeerPhase::Connecting | PeerPhase::AwaitingVerack | PeerPhase::Handshaked
        )
    }

    fn update_from_version(&mut self, version: &VersionMessage) {
        self.protocol_version = Some(version.version);
        self.services = version.services;
        self.user_agent = version.user_agent.clone();
        self.start_height = version.start_height;
        self.relay = version.relay;
    }
}

/// Commands the manager can send to a running connection
#[derive(Debug)]
pub enum PeerCommand {
    Send(Message),
    Disconnect,
}

/// Handle for reaching a running connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<PeerCommand>,
}

impl PeerHandle {
    pub async fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx
            .send(PeerCommand::Send(msg))
            .await
            .map_err(|_| PeerError::Disconnected)
    }

    pub async fn disconnect(&self) {
        // Already gone is fine
        let _ = self.tx.send(PeerCommand::Disconnect).await;
    }
}

/// Session settings shared by every connection of a node
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub protocol_version: i32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub relay: bool,
    /// Our own external address, if known
    pub self_address: Option<NetworkAddress>,
    pub max_ping_failures: u32,
    pub max_getheaders_stall_ticks: u32,
}

impl SessionConfig {
    pub fn new(
        params: &NetworkParams,
        timings: &PeerTimings,
        self_address: Option<NetworkAddress>,
    ) -> Self {
        Self {
            protocol_version: params.protocol_version,
            services: params.services,
            user_agent: params.user_agent.clone(),
            relay: false,
            self_address,
            max_ping_failures: timings.max_ping_failures,
            max_getheaders_stall_ticks: timings.max_getheaders_stall_ticks,
        }
    }
}

/// Work the connection task must do in response to an input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    Send(Message),
    ArmVerackTimer,
    /// Verack received; cancel the verack timer and start polling
    Handshaked,
    HandshakeFailed,
    PingFailed { consecutive: u32 },
    GetAddrFailed,
    GetHeadersFailed,
    /// Fetch the current tip and send `getheaders`
    RequestHeaders,
    MergeHeaders(Vec<BlockHeader>),
    ForwardAddresses(Vec<TimestampedAddress>),
    /// Answer a `getaddr` from the address book
    RespondAddresses,
    /// Answer a `getheaders` from the local chain
    ServeHeaders(GetHeadersMessage),
    Disconnect(DisconnectReason),
}

#[derive(Debug, Default)]
struct HandshakeFlags {
    sent_version: bool,
    received_version: bool,
    sent_verack: bool,
    received_verack: bool,
}

#[derive(Debug, Default)]
struct PingState {
    /// Nonce of the outstanding ping
    awaiting: Option<u64>,
    consecutive_failures: u32,
    /// Last nonce the peer pinged us with
    last_received: Option<u64>,
}

#[derive(Debug, Default)]
struct GetAddrState {
    sent: bool,
    awaiting: bool,
}

#[derive(Debug, Default)]
struct GetHeadersState {
    awaiting: bool,
    stall_ticks: u32,
}

/// Protocol state of one connection
#[derive(Debug)]
pub struct PeerSession {
    info: PeerInfo,
    config: Arc<SessionConfig>,
    handshake: HandshakeFlags,
    ping: PingState,
    getaddr: GetAddrState,
    getheaders: GetHeadersState,
}

impl PeerSession {
    pub fn new(info: PeerInfo, config: Arc<SessionConfig>) -> Self {
        Self {
            info,
            config,
            handshake: HandshakeFlags::default(),
            ping: PingState::default(),
            getaddr: GetAddrState::default(),
            getheaders: GetHeadersState::default(),
        }
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn into_info(self) -> PeerInfo {
        self.info
    }

    pub fn is_handshaked(&self) -> bool {
        self.info.phase == PeerPhase::Handshaked
    }

    pub fn awaiting_pong(&self) -> bool {
        self.ping.awaiting.is_some()
    }

    pub fn awaiting_headers(&self) -> bool {
        self.getheaders.awaiting
    }

    pub fn awaiting_addr(&self) -> bool {
        self.getaddr.awaiting
    }

    /// Our `version` for this peer
    pub fn local_version(&self, start_height: i32, nonce: u64, now: i64) -> VersionMessage {
        VersionMessage {
            version: self.config.protocol_version,
            services: self.config.services,
            timestamp: now,
            receiver: NetworkAddress::from(self.info.addr),
            emitter: self
                .config
                .self_address
                .map(|a| a.with_services(self.config.services)),
            nonce,
            user_agent: self.config.user_agent.clone(),
            start_height,
            relay: Some(self.config.relay),
        }
    }

    /// Connection established: send our version and wait for verack
    pub fn start(&mut self, version: VersionMessage) -> Vec<PeerAction> {
        self.info.phase = PeerPhase::AwaitingVerack;
        self.handshake.sent_version = true;
        vec![
            PeerAction::Send(Message::Version(version)),
            PeerAction::ArmVerackTimer,
        ]
    }

    pub fn on_message(&mut self, message: Message, now: i64) -> Vec<PeerAction> {
        match message {
            Message::Version(version) => self.on_version(version),
            Message::Verack => self.on_verack(now),
            Message::Ping(nonce) => {
                self.ping.last_received = Some(nonce);
                vec![PeerAction::Send(Message::Pong(nonce))]
            }
            Message::Pong(nonce) => {
                self.on_pong(nonce);
                Vec::new()
            }
            Message::GetAddr => vec![PeerAction::RespondAddresses],
            Message::Addr(entries) => self.on_addr(entries, now),
            Message::GetHeaders(request) => vec![PeerAction::ServeHeaders(request)],
            Message::Headers(headers) => {
                if headers.is_empty() {
                    // Nothing new; let the next poll ask again
                    self.getheaders.awaiting = false;
                    self.getheaders.stall_ticks = 0;
                    return Vec::new();
                }
                vec![PeerAction::MergeHeaders(headers)]
            }
            Message::XVersion(_) => vec![PeerAction::Send(Message::XVerack)],
            Message::SendHeaders | Message::XVerack => Vec::new(),
            Message::Other { command, payload } => {
                log::debug!(
                    "Ignoring '{}' ({} bytes) from {}",
                    command,
                    payload.len(),
                    self.info.addr
                );
                Vec::new()
            }
        }
    }

    fn on_version(&mut self, version: VersionMessage) -> Vec<PeerAction> {
        self.info.update_from_version(&version);
        self.handshake.received_version = true;
        log::debug!(
            "{} version {} ({}) height {}",
            self.info.addr,
            version.version,
            version.user_agent,
            version.start_height
        );

        if self.handshake.sent_verack {
            return Vec::new();
        }
        self.handshake.sent_verack = true;
        vec![PeerAction::Send(Message::Verack)]
    }

    fn on_verack(&mut self, now: i64) -> Vec<PeerAction> {
        if self.handshake.received_verack {
            return Vec::new();
        }
        self.handshake.received_verack = true;
        self.info.phase = PeerPhase::Handshaked;
        self.info.last_success = Some(now);
        vec![PeerAction::Handshaked]
    }

    fn on_pong(&mut self, nonce: u64) {
        match self.ping.awaiting {
            Some(expected) if expected == nonce => {
                self.ping.awaiting = None;
                self.ping.consecutive_failures = 0;
            }
            Some(expected) => log::warn!(
                "Pong nonce mismatch from {}: expected {}, got {}",
                self.info.addr,
                expected,
                nonce
            ),
            None => log::debug!("Unsolicited pong from {}", self.info.addr),
        }
    }

    fn on_addr(&mut self, entries: Vec<TimestampedAddress>, now: i64) -> Vec<PeerAction> {
        self.getaddr.awaiting = false;
        let fresh = filter_fresh(&entries, now, self.config.self_address.as_ref());
        log::debug!(
            "{} sent {} addresses, {} fresh",
            self.info.addr,
            entries.len(),
            fresh.len()
        );
        if fresh.is_empty() {
            return Vec::new();
        }
        vec![PeerAction::ForwardAddresses(fresh)]
    }

    /// Verack deadline passed
    pub fn on_verack_timeout(&mut self) -> Vec<PeerAction> {
        if self.handshake.received_verack {
            return Vec::new();
        }
        self.info.failures.verack += 1;
        vec![
            PeerAction::HandshakeFailed,
            PeerAction::Disconnect(DisconnectReason::VerackTimeout),
        ]
    }

    /// Keepalive timer fired; `nonce` is used if a new ping goes out
    pub fn on_ping_tick(&mut self, nonce: u64) -> Vec<PeerAction> {
        if !self.is_handshaked() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.ping.awaiting.is_some() {
            self.ping.consecutive_failures += 1;
            self.info.failures.ping += 1;
            let consecutive = self.ping.consecutive_failures;
            actions.push(PeerAction::PingFailed { consecutive });
            if consecutive > self.config.max_ping_failures {
                actions.push(PeerAction::Disconnect(DisconnectReason::PingTimeout));
                return actions;
            }
        }

        self.ping.awaiting = Some(nonce);
        actions.push(PeerAction::Send(Message::Ping(nonce)));
        actions
    }

    /// Address discovery timer fired
    pub fn on_getaddr_tick(&mut self) -> Vec<PeerAction> {
        if !self.is_handshaked() {
            return Vec::new();
        }

        if self.getaddr.awaiting {
            self.info.failures.getaddr += 1;
            // Allow a retry on the next tick
            self.getaddr.awaiting = false;
            self.getaddr.sent = false;
            return vec![PeerAction::GetAddrFailed];
        }

        if self.getaddr.sent {
            return Vec::new();
        }
        self.getaddr.sent = true;
        self.getaddr.awaiting = true;
        vec![PeerAction::Send(Message::GetAddr)]
    }

    /// Header poll timer fired
    pub fn on_getheaders_tick(&mut self) -> Vec<PeerAction> {
        if !self.is_handshaked() {
            return Vec::new();
        }

        if self.getheaders.awaiting {
            self.getheaders.stall_ticks += 1;
            if self.getheaders.stall_ticks >= self.config.max_getheaders_stall_ticks {
                self.info.failures.getheaders += 1;
                self.getheaders.awaiting = false;
                self.getheaders.stall_ticks = 0;
                return vec![PeerAction::GetHeadersFailed];
            }
            return Vec::new();
        }

        vec![PeerAction::RequestHeaders]
    }

    /// Build `getheaders` for the given locator and mark it outstanding
    pub fn getheaders_request(&mut self, locators: Vec<BlockHash>) -> Message {
        self.getheaders.awaiting = true;
        self.getheaders.stall_ticks = 0;
        Message::GetHeaders(GetHeadersMessage::new(
            self.config.protocol_version as u32,
            locators,
        ))
    }

    /// Merge finished; keep syncing while the peer has more to give
    pub fn on_headers_merged(&mut self, accepted: usize) -> Vec<PeerAction> {
        self.getheaders.awaiting = false;
        self.getheaders.stall_ticks = 0;
        if accepted == 0 {
            return Vec::new();
        }
        vec![PeerAction::RequestHeaders]
    }

    /// Batch did not link to our chain
    pub fn on_headers_rejected(&mut self) {
        self.getheaders.awaiting = false;
        self.getheaders.stall_ticks = 0;
    }

    pub fn begin_disconnect(&mut self) {
        self.info.phase = PeerPhase::Disconnecting;
    }

    pub fn finish_disconnect(&mut self) {
        self.info.phase = PeerPhase::Disconnected;
    }
}

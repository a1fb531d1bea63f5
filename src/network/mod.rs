//! P2P Networking module
//!
//! Provides the peer-to-peer side of the node.
//!
//! # Features
//! - TCP transport over any duplex byte stream
//! - Version/verack handshake and ping/pong keepalive
//! - Address discovery (getaddr/addr, DNS seeds)
//! - Header sync (getheaders/headers)
//! - Structured event stream

pub mod addrbook;
pub mod connection;
pub mod discovery;
pub mod events;
pub mod manager;
pub mod node;
pub mod params;
pub mod peer;
pub mod transport;

pub use addrbook::{AddressBook, AddressBookEntry, FRESHNESS_WINDOW_SECS, MAX_ADDRESS_BOOK_SIZE};
pub use connection::{run_peer, PeerContext, PeerDelegate};
pub use discovery::{resolve_external_address, resolve_seeds};
pub use events::{EventBus, NetworkUpdate, Severity, UpdateKind};
pub use manager::{PeerManager, MAX_INBOUND};
pub use node::{ConfigError, Node, NodeConfig, NodeStatus};
pub use params::{JitterRange, NetworkParams, PeerTimings, PROTOCOL_VERSION};
pub use peer::{
    ConnectionDirection, DisconnectReason, FailureCounters, PeerAction, PeerCommand, PeerError,
    PeerHandle, PeerInfo, PeerPhase, PeerSession, SessionConfig,
};
pub use transport::{connect, Listener, PeerStream};

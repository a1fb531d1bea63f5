//! chainpeer: a header-syncing Bitcoin-family P2P node in Rust
//!
//! This crate provides:
//! - The Bitcoin wire protocol (envelopes, varints, control messages)
//! - A per-peer protocol state machine with handshake, keepalive,
//!   address discovery and header sync
//! - A header chain that only grows by linked batches
//! - A peer manager over TCP with persistence of peers and headers
//!
//! # Example
//!
//! ```rust,no_run
//! use chainpeer::network::{Node, NodeConfig};
//! use chainpeer::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = NodeConfig {
//!     bootstrap_peers: vec!["203.0.113.10".to_string()],
//!     ..Default::default()
//! };
//! let node = Node::new(config, Arc::new(MemoryStore::new())).await?;
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod cli;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod wire;

// Re-export commonly used types
pub use chain::{BlockHash, BlockHeader, HeaderChain, HeaderRecord};
pub use network::{NetworkParams, Node, NodeConfig, PeerManager};
pub use storage::{FileStore, MemoryStore, NetworkStore};
pub use wire::{Message, MessageCodec, NetworkAddress};

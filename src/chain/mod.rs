//! Block header chain
//!
//! - 80-byte headers and their double-SHA256 identities
//! - The locally accepted header chain and its merge rules

pub mod header;
pub mod store;

pub use header::{BlockHash, BlockHeader, HeaderRecord, BLOCK_HEADER_SIZE, WIRE_HEADER_SIZE};
pub use store::{ChainError, ChainTip, HeaderChain};

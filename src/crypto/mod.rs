//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 and double SHA-256 hashing
//! - Envelope checksums

pub mod hash;

pub use hash::{checksum, double_sha256, sha256};

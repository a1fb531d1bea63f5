//! Block headers and their hashes
//!
//! Only the 80-byte header is tracked; transactions never leave the wire.

use crate::chain::store::ChainError;
use crate::crypto::double_sha256;
use crate::wire::{Decodable, Encodable, WireError, WireReader};
use bytes::BufMut;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Header Constants
// =============================================================================

/// Serialized header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Header size inside a `headers` message (header + zero transaction count)
pub const WIRE_HEADER_SIZE: usize = BLOCK_HEADER_SIZE + 1;

// =============================================================================
// Block Hash
// =============================================================================

/// Double-SHA256 of a block header
///
/// Bytes are kept in the order the hash function produced them, which is
/// also the order used on the wire. Text forms are byte-reversed so the
/// leading zeros of a valid proof of work come first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Most-significant-byte-first hex
    pub fn to_hex(&self) -> String {
        reversed_hex(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ChainError> {
        parse_reversed_hex(s).map(BlockHash)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl Encodable for BlockHash {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }
}

impl Decodable for BlockHash {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(BlockHash(reader.read_array::<32>("block hash")?))
    }
}

pub(crate) fn reversed_hex(bytes: &[u8; 32]) -> String {
    let mut reversed = *bytes;
    reversed.reverse();
    hex::encode(reversed)
}

pub(crate) fn parse_reversed_hex(s: &str) -> Result<[u8; 32], ChainError> {
    let decoded = hex::decode(s.trim()).map_err(|e| ChainError::InvalidHash(e.to_string()))?;
    let mut bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|v: Vec<u8>| ChainError::InvalidHash(format!("expected 32 bytes, got {}", v.len())))?;
    bytes.reverse();
    Ok(bytes)
}

// =============================================================================
// Block Header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: BlockHash,
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Double-SHA256 of the 80-byte serialization
    pub fn hash(&self) -> BlockHash {
        let mut bytes = Vec::with_capacity(BLOCK_HEADER_SIZE);
        self.encode(&mut bytes);
        BlockHash(double_sha256(&bytes))
    }

    pub fn merkle_root_hex(&self) -> String {
        reversed_hex(&self.merkle_root)
    }
}

impl Encodable for BlockHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        self.prev_block.encode(buf);
        buf.put_slice(&self.merkle_root);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: reader.read_i32_le("header version")?,
            prev_block: BlockHash::decode(reader)?,
            merkle_root: reader.read_array::<32>("merkle root")?,
            timestamp: reader.read_u32_le("header timestamp")?,
            bits: reader.read_u32_le("header bits")?,
            nonce: reader.read_u32_le("header nonce")?,
        })
    }
}

/// A header accepted into the local chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRecord {
    /// Local height, starting at 1 for the header after the anchor
    pub height: u32,
    pub hash: BlockHash,
    pub header: BlockHeader,
}

impl HeaderRecord {
    pub fn new(height: u32, header: BlockHeader) -> Self {
        Self {
            height,
            hash: header.hash(),
            header,
        }
    }
}

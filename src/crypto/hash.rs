//! Hashing utilities for the wire protocol
//!
//! Provides the SHA-256 based hashes used for message checksums and
//! block header identities.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for block hashes and envelope checksums
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// First four bytes of the double SHA-256 of a payload
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_double_sha256_is_hash_of_hash() {
        let once = sha256(b"chainpeer");
        assert_eq!(double_sha256(b"chainpeer"), sha256(&once));
        assert_ne!(double_sha256(b"chainpeer"), once);
    }

    #[test]
    fn test_empty_payload_checksum() {
        // Every verack carries this checksum
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }
}

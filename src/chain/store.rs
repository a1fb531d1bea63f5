//! In-memory header chain
//!
//! Holds the sequence of headers accepted so far, anchored at a configured
//! genesis hash, and merges batches received from untrusted peers.

use crate::chain::header::{BlockHash, BlockHeader, HeaderRecord};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Header chain errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Batch contains excluded block {0}")]
    ExcludedHash(BlockHash),
    #[error("No header in batch extends tip {tip}")]
    DoesNotExtendTip { tip: BlockHash },
    #[error("Invalid block hash: {0}")]
    InvalidHash(String),
}

/// Hash and height of the newest accepted header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u32,
}

/// Linked sequence of validated headers
#[derive(Debug, Clone)]
pub struct HeaderChain {
    anchor: BlockHash,
    excluded: HashSet<BlockHash>,
    records: Vec<HeaderRecord>,
    /// hash -> position in `records`
    index: HashMap<BlockHash, usize>,
}

impl HeaderChain {
    /// Empty chain whose first header must reference `anchor`
    pub fn new(anchor: BlockHash, excluded: impl IntoIterator<Item = BlockHash>) -> Self {
        Self {
            anchor,
            excluded: excluded.into_iter().collect(),
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn anchor(&self) -> BlockHash {
        self.anchor
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Height of the tip (0 when only the anchor is known)
    pub fn height(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn tip(&self) -> Option<&HeaderRecord> {
        self.records.last()
    }

    /// Hash new headers must build on
    pub fn tip_hash(&self) -> BlockHash {
        self.tip().map_or(self.anchor, |r| r.hash)
    }

    pub fn chain_tip(&self) -> ChainTip {
        ChainTip {
            hash: self.tip_hash(),
            height: self.height(),
        }
    }

    /// Locator for a `getheaders` request
    pub fn locator(&self) -> Vec<BlockHash> {
        vec![self.tip_hash()]
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&HeaderRecord> {
        self.index.get(hash).map(|&i| &self.records[i])
    }

    pub fn get_by_height(&self, height: u32) -> Option<&HeaderRecord> {
        if height == 0 {
            return None;
        }
        self.records.get(height as usize - 1)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn records(&self) -> &[HeaderRecord] {
        &self.records
    }

    pub fn is_excluded(&self, hash: &BlockHash) -> bool {
        self.excluded.contains(hash)
    }

    /// Merge a batch of headers
    ///
    /// Starting from the header that builds on the current tip, follows
    /// prev-links through the batch in any order. Headers that don't link
    /// are dropped. Returns the accepted headers in chain order.
    pub fn append(&mut self, batch: &[BlockHeader]) -> Result<Vec<HeaderRecord>, ChainError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let hashed: Vec<(BlockHash, &BlockHeader)> = batch.iter().map(|h| (h.hash(), h)).collect();

        if let Some((hash, _)) = hashed.iter().find(|(hash, _)| self.excluded.contains(hash)) {
            return Err(ChainError::ExcludedHash(*hash));
        }

        // First header seen for each parent wins
        let mut by_prev: HashMap<BlockHash, usize> = HashMap::with_capacity(hashed.len());
        for (i, (_, header)) in hashed.iter().enumerate() {
            by_prev.entry(header.prev_block).or_insert(i);
        }

        let tip = self.tip_hash();
        if !by_prev.contains_key(&tip) {
            return Err(ChainError::DoesNotExtendTip { tip });
        }

        let mut accepted = Vec::new();
        let mut current = tip;
        let mut height = self.height();
        while let Some(&i) = by_prev.get(&current) {
            let (hash, header) = hashed[i];
            if self.index.contains_key(&hash) || accepted.len() == hashed.len() {
                break;
            }
            height += 1;
            accepted.push(HeaderRecord {
                height,
                hash,
                header: *header,
            });
            current = hash;
        }

        for record in &accepted {
            self.index.insert(record.hash, self.records.len());
            self.records.push(*record);
        }

        Ok(accepted)
    }

    /// Rebuild from persisted records
    ///
    /// Records are taken in height order and loading stops at the first one
    /// that doesn't extend the chain. Returns the number restored.
    pub fn restore(&mut self, records: impl IntoIterator<Item = HeaderRecord>) -> usize {
        self.records.clear();
        self.index.clear();

        let mut sorted: Vec<HeaderRecord> = records.into_iter().collect();
        sorted.sort_by_key(|r| r.height);

        for record in sorted {
            let hash = record.header.hash();
            let valid = record.height == self.height() + 1
                && record.header.prev_block == self.tip_hash()
                && record.hash == hash
                && !self.excluded.contains(&hash);
            if !valid {
                log::warn!(
                    "Stopped restoring headers at height {} ({})",
                    record.height,
                    record.hash
                );
                break;
            }
            self.index.insert(hash, self.records.len());
            self.records.push(record);
        }

        self.records.len()
    }

    /// Headers following the first locator we know, up to `stop` or `max`
    ///
    /// Unknown locators fall back to the start of the chain.
    pub fn headers_after(
        &self,
        locators: &[BlockHash],
        stop: &BlockHash,
        max: usize,
    ) -> Vec<BlockHeader> {
        let start = locators
            .iter()
            .find_map(|hash| {
                if *hash == self.anchor {
                    Some(0)
                } else {
                    self.index.get(hash).map(|&i| i + 1)
                }
            })
            .unwrap_or(0);

        let mut headers = Vec::new();
        for record in self.records.iter().skip(start).take(max) {
            headers.push(record.header);
            if !stop.is_zero() && record.hash == *stop {
                break;
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::header::tests::{genesis_header, BLOCK_1_HEADER};
    use crate::wire::Decodable;

    fn child_of(prev: BlockHash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [nonce as u8; 32],
            timestamp: 1_600_000_000 + nonce,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    /// Chain of `n` synthetic headers on top of `anchor`
    fn chain_of(anchor: BlockHash, n: u32) -> (HeaderChain, Vec<BlockHeader>) {
        let mut chain = HeaderChain::new(anchor, []);
        let mut headers = Vec::new();
        let mut prev = anchor;
        for i in 0..n {
            let header = child_of(prev, i);
            prev = header.hash();
            headers.push(header);
        }
        chain.append(&headers).unwrap();
        (chain, headers)
    }

    #[test]
    fn test_empty_chain_uses_anchor() {
        let anchor = genesis_header().hash();
        let chain = HeaderChain::new(anchor, []);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.tip_hash(), anchor);
        assert_eq!(chain.locator(), vec![anchor]);
        assert_eq!(chain.chain_tip(), ChainTip { hash: anchor, height: 0 });
        assert!(chain.tip().is_none());
    }

    #[test]
    fn test_accepts_block_one_on_genesis_anchor() {
        let mut chain = HeaderChain::new(genesis_header().hash(), []);
        let block1 = BlockHeader::from_bytes(&BLOCK_1_HEADER).unwrap();

        let accepted = chain.append(&[block1]).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].height, 1);
        assert_eq!(chain.tip_hash(), block1.hash());
    }

    #[test]
    fn test_merge_drops_unlinked_header() {
        let (mut chain, _) = chain_of(BlockHash([7; 32]), 5);
        let tip = chain.tip_hash();

        let x = child_of(tip, 100);
        let y = child_of(x.hash(), 101);
        let z = child_of(BlockHash([9; 32]), 102);

        let accepted = chain.append(&[x, y, z]).unwrap();
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].hash, x.hash());
        assert_eq!(accepted[0].height, 6);
        assert_eq!(accepted[1].hash, y.hash());
        assert_eq!(accepted[1].height, 7);
        assert_eq!(chain.height(), 7);
        assert!(!chain.contains(&z.hash()));
    }

    #[test]
    fn test_merge_out_of_order_batch() {
        let anchor = BlockHash([1; 32]);
        let mut chain = HeaderChain::new(anchor, []);
        let a = child_of(anchor, 1);
        let b = child_of(a.hash(), 2);
        let c = child_of(b.hash(), 3);

        let accepted = chain.append(&[c, a, b]).unwrap();
        let hashes: Vec<BlockHash> = accepted.iter().map(|r| r.hash).collect();
        assert_eq!(hashes, vec![a.hash(), b.hash(), c.hash()]);
        assert_eq!(chain.get_by_height(3).unwrap().hash, c.hash());
    }

    #[test]
    fn test_rejects_batch_not_extending_tip() {
        let (mut chain, headers) = chain_of(BlockHash([3; 32]), 4);
        let stale = child_of(headers[1].hash(), 50);
        let orphan = child_of(BlockHash([4; 32]), 51);

        let err = chain.append(&[stale, orphan]).unwrap_err();
        assert!(matches!(err, ChainError::DoesNotExtendTip { .. }));
        assert_eq!(chain.height(), 4);
    }

    #[test]
    fn test_rejects_excluded_hash() {
        let anchor = BlockHash([5; 32]);
        let a = child_of(anchor, 1);
        let b = child_of(a.hash(), 2);
        let mut chain = HeaderChain::new(anchor, [b.hash()]);

        let err = chain.append(&[a, b]).unwrap_err();
        assert_eq!(err, ChainError::ExcludedHash(b.hash()));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_duplicate_batch_rejected() {
        let (mut chain, headers) = chain_of(BlockHash([6; 32]), 3);
        assert!(chain.append(&headers).is_err());
        assert_eq!(chain.height(), 3);
        assert!(chain.append(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_restore_stops_at_gap() {
        let anchor = BlockHash([2; 32]);
        let (chain, headers) = chain_of(anchor, 5);
        let mut records: Vec<HeaderRecord> = chain.records().to_vec();
        records.remove(2);

        let mut restored = HeaderChain::new(anchor, []);
        assert_eq!(restored.restore(records), 2);
        assert_eq!(restored.tip_hash(), headers[1].hash());
    }

    #[test]
    fn test_headers_after_locator() {
        let anchor = BlockHash([8; 32]);
        let (chain, headers) = chain_of(anchor, 10);

        let from_anchor = chain.headers_after(&[anchor], &BlockHash::ZERO, 2000);
        assert_eq!(from_anchor.len(), 10);

        let after_third = chain.headers_after(&[headers[2].hash()], &BlockHash::ZERO, 2000);
        assert_eq!(after_third.first(), Some(&headers[3]));
        assert_eq!(after_third.len(), 7);

        let stopped = chain.headers_after(&[headers[2].hash()], &headers[5].hash(), 2000);
        assert_eq!(stopped.len(), 3);

        let capped = chain.headers_after(&[BlockHash([0xAB; 32])], &BlockHash::ZERO, 4);
        assert_eq!(capped, headers[..4].to_vec());
    }
}

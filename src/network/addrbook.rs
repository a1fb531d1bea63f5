//! Address book for peer discovery
//!
//! Keeps every address learned from `addr` messages, DNS seeds or the
//! configured peer list, deduplicated by ip and port. Addresses older than
//! the freshness window, and our own external address, are never merged.

use crate::wire::{NetworkAddress, ServiceFlags, TimestampedAddress};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

// =============================================================================
// Constants
// =============================================================================

/// Entries last seen longer ago than this are stale (3 hours)
pub const FRESHNESS_WINDOW_SECS: i64 = 3 * 60 * 60;

/// Upper bound on remembered addresses
pub const MAX_ADDRESS_BOOK_SIZE: usize = 20_000;

/// Whether `timestamp` lies inside the freshness window ending at `now`
///
/// Timestamps in the future count as fresh.
pub fn is_fresh(timestamp: i64, now: i64) -> bool {
    now - timestamp < FRESHNESS_WINDOW_SECS
}

/// Entries of an `addr` batch worth keeping
pub fn filter_fresh(
    entries: &[TimestampedAddress],
    now: i64,
    self_address: Option<&NetworkAddress>,
) -> Vec<TimestampedAddress> {
    entries
        .iter()
        .filter(|e| is_fresh(e.timestamp as i64, now))
        .filter(|e| self_address != Some(&e.address))
        .filter(|e| e.address.port != 0 && !e.address.ip.is_unspecified())
        .copied()
        .collect()
}

// =============================================================================
// Address Book Entry
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBookEntry {
    /// Unix seconds
    pub last_seen: i64,
    pub address: NetworkAddress,
    /// Peer that told us about this address
    pub source: Option<SocketAddr>,
    pub source_services: ServiceFlags,
}

impl AddressBookEntry {
    pub fn to_timestamped(&self) -> TimestampedAddress {
        TimestampedAddress {
            timestamp: self.last_seen.clamp(0, u32::MAX as i64) as u32,
            address: self.address,
        }
    }
}

// =============================================================================
// Address Book
// =============================================================================

#[derive(Debug, Default)]
pub struct AddressBook {
    entries: HashMap<NetworkAddress, AddressBookEntry>,
    self_address: Option<NetworkAddress>,
}

impl AddressBook {
    pub fn new(self_address: Option<NetworkAddress>) -> Self {
        Self {
            entries: HashMap::new(),
            self_address,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn self_address(&self) -> Option<&NetworkAddress> {
        self.self_address.as_ref()
    }

    pub fn contains(&self, address: &NetworkAddress) -> bool {
        self.entries.contains_key(address)
    }

    pub fn get(&self, address: &NetworkAddress) -> Option<&AddressBookEntry> {
        self.entries.get(address)
    }

    /// Merge an `addr` batch, returning how many entries were added or refreshed
    pub fn merge(
        &mut self,
        batch: &[TimestampedAddress],
        source: Option<(SocketAddr, ServiceFlags)>,
        now: i64,
    ) -> usize {
        let mut changed = 0;
        for entry in filter_fresh(batch, now, self.self_address.as_ref()) {
            let candidate = AddressBookEntry {
                last_seen: entry.timestamp as i64,
                address: entry.address,
                source: source.map(|(addr, _)| addr),
                source_services: source.map_or(ServiceFlags::empty(), |(_, s)| s),
            };
            if self.upsert(candidate) {
                changed += 1;
            }
        }
        changed
    }

    /// Add a single address regardless of freshness (seeds, configured peers)
    pub fn add(&mut self, address: NetworkAddress, now: i64) -> bool {
        if self.self_address == Some(address) {
            return false;
        }
        self.upsert(AddressBookEntry {
            last_seen: now,
            address,
            source: None,
            source_services: ServiceFlags::empty(),
        })
    }

    /// Refresh `last_seen` after a successful handshake
    pub fn mark_seen(&mut self, address: &NetworkAddress, services: ServiceFlags, now: i64) {
        if let Some(entry) = self.entries.get_mut(address) {
            entry.last_seen = entry.last_seen.max(now);
            entry.address.services = services;
        }
    }

    fn upsert(&mut self, candidate: AddressBookEntry) -> bool {
        match self.entries.get_mut(&candidate.address) {
            Some(existing) => {
                if candidate.last_seen <= existing.last_seen {
                    return false;
                }
                existing.last_seen = candidate.last_seen;
                if !candidate.address.services.is_empty() {
                    existing.address.services = candidate.address.services;
                }
                true
            }
            None => {
                if self.entries.len() >= MAX_ADDRESS_BOOK_SIZE {
                    self.evict_oldest();
                }
                self.entries.insert(candidate.address, candidate);
                true
            }
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .entries
            .values()
            .min_by_key(|e| e.last_seen)
            .map(|e| e.address)
        {
            self.entries.remove(&oldest);
        }
    }

    /// Replace contents with persisted entries
    pub fn restore(&mut self, entries: impl IntoIterator<Item = AddressBookEntry>) -> usize {
        self.entries.clear();
        for entry in entries {
            if self.self_address != Some(entry.address) {
                self.upsert(entry);
            }
        }
        self.entries.len()
    }

    /// All entries, most recently seen first
    pub fn snapshot(&self) -> Vec<AddressBookEntry> {
        let mut entries: Vec<AddressBookEntry> = self.entries.values().copied().collect();
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        entries
    }

    /// Freshest entries for a `getaddr` reply
    pub fn sample(&self, max: usize) -> Vec<TimestampedAddress> {
        self.snapshot()
            .into_iter()
            .take(max)
            .map(|e| e.to_timestamped())
            .collect()
    }

    /// Random addresses to dial, skipping ones already in use
    pub fn candidates(&self, exclude: &HashSet<SocketAddr>, max: usize) -> Vec<NetworkAddress> {
        let mut addrs: Vec<NetworkAddress> = self
            .entries
            .keys()
            .filter(|a| !exclude.contains(&a.to_socket_addr()))
            .copied()
            .collect();
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(max);
        addrs
    }
}

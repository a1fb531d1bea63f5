//! Network constants and peer timing settings

use crate::chain::BlockHash;
use crate::wire::ServiceFlags;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol version we speak
pub const PROTOCOL_VERSION: i32 = 70015;

/// Standard genesis block shared by Bitcoin and Bitcoin Cash
pub const GENESIS_HASH_HEX: &str =
    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

fn default_user_agent() -> String {
    format!("/chainpeer:{}/", env!("CARGO_PKG_VERSION"))
}

fn genesis_hash() -> BlockHash {
    // Constant literal, always valid hex of the right length
    BlockHash::from_hex(GENESIS_HASH_HEX).unwrap_or(BlockHash::ZERO)
}

/// Service bits serialised as a plain integer
mod service_bits {
    use crate::wire::ServiceFlags;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flags: &ServiceFlags, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(flags.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ServiceFlags, D::Error> {
        Ok(ServiceFlags::from_bits_retain(u64::deserialize(deserializer)?))
    }
}

/// Per-network wire constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub name: String,
    /// Envelope magic, written big-endian
    pub magic: u32,
    pub protocol_version: i32,
    #[serde(with = "service_bits")]
    pub services: ServiceFlags,
    pub user_agent: String,
    /// Hash the first synced header must build on
    pub genesis_hash: BlockHash,
    /// Blocks that must never enter the chain
    #[serde(default)]
    pub excluded_hashes: Vec<BlockHash>,
    pub default_port: u16,
    #[serde(default)]
    pub dns_seeds: Vec<String>,
}

impl NetworkParams {
    pub fn bitcoin_cash() -> Self {
        Self {
            name: "bch".to_string(),
            magic: 0xe3e1f3e8,
            protocol_version: PROTOCOL_VERSION,
            services: ServiceFlags::BITCOIN_CASH,
            user_agent: default_user_agent(),
            genesis_hash: genesis_hash(),
            excluded_hashes: Vec::new(),
            default_port: 8333,
            dns_seeds: vec![
                "seed.bitcoinabc.org".to_string(),
                "seed-abc.bitcoinforks.org".to_string(),
                "btccash-seeder.bitcoinunlimited.info".to_string(),
                "seed.bchd.cash".to_string(),
            ],
        }
    }

    pub fn bitcoin() -> Self {
        Self {
            name: "btc".to_string(),
            magic: 0xf9beb4d9,
            protocol_version: PROTOCOL_VERSION,
            services: ServiceFlags::empty(),
            user_agent: default_user_agent(),
            genesis_hash: genesis_hash(),
            excluded_hashes: Vec::new(),
            default_port: 8333,
            dns_seeds: vec![
                "seed.bitcoin.sipa.be".to_string(),
                "dnsseed.bluematt.me".to_string(),
                "seed.bitcoinstats.com".to_string(),
                "seed.bitcoin.jonasschnelli.ch".to_string(),
            ],
        }
    }

    /// Preset by short name (`bch`, `btc`)
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bch" | "bitcoincash" | "bitcoin-cash" => Some(Self::bitcoin_cash()),
            "btc" | "bitcoin" => Some(Self::bitcoin()),
            _ => None,
        }
    }
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self::bitcoin_cash()
    }
}

/// Inclusive range a per-peer timer period is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl JitterRange {
    pub const fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Draw a period; an inverted range collapses to `min_secs`
    pub fn pick<R: Rng>(&self, rng: &mut R) -> Duration {
        let secs = if self.max_secs > self.min_secs {
            rng.gen_range(self.min_secs..=self.max_secs)
        } else {
            self.min_secs
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Timeouts and polling periods for each connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerTimings {
    pub connect_timeout_secs: u64,
    pub verack_timeout_secs: u64,
    pub ping_interval: JitterRange,
    pub getaddr_interval: JitterRange,
    pub getheaders_interval: JitterRange,
    /// Consecutive missed pongs tolerated before disconnecting
    pub max_ping_failures: u32,
    /// Getheaders polls to wait on an outstanding request
    pub max_getheaders_stall_ticks: u32,
}

impl PeerTimings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn verack_timeout(&self) -> Duration {
        Duration::from_secs(self.verack_timeout_secs)
    }
}

impl Default for PeerTimings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            verack_timeout_secs: 10,
            ping_interval: JitterRange::new(10, 40),
            getaddr_interval: JitterRange::new(10, 40),
            getheaders_interval: JitterRange::new(5, 10),
            max_ping_failures: 3,
            max_getheaders_stall_ticks: 3,
        }
    }
}

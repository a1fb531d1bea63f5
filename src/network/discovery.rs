//! Peer discovery
//!
//! - DNS seed resolution
//! - Our own external address, used to avoid dialling ourselves

use crate::network::peer::PeerError;
use crate::wire::{NetworkAddress, ServiceFlags};
use std::time::Duration;
use tokio::net::lookup_host;

// =============================================================================
// Constants
// =============================================================================

/// Upper bound on a single seed lookup
const SEED_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Append the default port unless the seed names one
fn seed_target(seed: &str, default_port: u16) -> String {
    let seed = seed.trim();
    let has_port = if seed.starts_with('[') {
        seed.contains("]:")
    } else {
        seed.matches(':').count() == 1
    };
    if has_port {
        seed.to_string()
    } else if seed.contains(':') {
        format!("[{}]:{}", seed, default_port)
    } else {
        format!("{}:{}", seed, default_port)
    }
}

async fn lookup(target: &str) -> Result<Vec<NetworkAddress>, PeerError> {
    let addrs = tokio::time::timeout(SEED_LOOKUP_TIMEOUT, lookup_host(target))
        .await
        .map_err(|_| PeerError::Timeout(format!("resolving {}", target)))?
        .map_err(|e| PeerError::InvalidAddress(format!("{}: {}", target, e)))?;
    Ok(addrs.map(NetworkAddress::from).collect())
}

// =============================================================================
// DNS Seeds
// =============================================================================

/// Resolve DNS seeds into candidate peer addresses
///
/// Seeds that fail to resolve are logged and skipped. Results are
/// deduplicated and tagged as full nodes.
pub async fn resolve_seeds(seeds: &[String], default_port: u16) -> Vec<NetworkAddress> {
    let mut found: Vec<NetworkAddress> = Vec::new();

    for seed in seeds {
        let target = seed_target(seed, default_port);
        log::info!("Resolving DNS seed: {}", target);

        match lookup(&target).await {
            Ok(addrs) => {
                let before = found.len();
                for addr in addrs {
                    if !found.contains(&addr) {
                        found.push(addr.with_services(ServiceFlags::NETWORK));
                    }
                }
                log::debug!("{} gave {} addresses", seed, found.len() - before);
            }
            Err(e) => log::warn!("Failed to resolve DNS seed {}: {}", seed, e),
        }
    }

    log::info!("Resolved {} addresses from DNS seeds", found.len());
    found
}

// =============================================================================
// External Address
// =============================================================================

/// Resolve the configured external address (IP literal or host name)
pub async fn resolve_external_address(
    input: &str,
    default_port: u16,
) -> Result<NetworkAddress, PeerError> {
    if let Ok(address) = NetworkAddress::parse(input, default_port) {
        return Ok(address);
    }
    lookup(&seed_target(input, default_port))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| PeerError::InvalidAddress(format!("{} did not resolve", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_target_ports() {
        assert_eq!(seed_target("seed.bitcoinabc.org", 8333), "seed.bitcoinabc.org:8333");
        assert_eq!(seed_target("seed.example:18333", 8333), "seed.example:18333");
        assert_eq!(seed_target("2001:db8::1", 8333), "[2001:db8::1]:8333");
        assert_eq!(seed_target("[2001:db8::1]:9000", 8333), "[2001:db8::1]:9000");
    }

    #[tokio::test]
    async fn test_resolve_literal_seeds() {
        let seeds = vec![
            "127.0.0.1".to_string(),
            "127.0.0.1:8333".to_string(),
            "127.0.0.2:18333".to_string(),
        ];
        let found = resolve_seeds(&seeds, 8333).await;

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].to_string(), "127.0.0.1:8333");
        assert_eq!(found[1].port, 18333);
        assert!(found.iter().all(|a| a.services == ServiceFlags::NETWORK));
    }

    #[tokio::test]
    async fn test_bad_seed_skipped() {
        let seeds = vec!["seed.example:notaport".to_string(), "10.1.2.3".to_string()];
        let found = resolve_seeds(&seeds, 8333).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].to_string(), "10.1.2.3:8333");
    }

    #[tokio::test]
    async fn test_external_address_literal() {
        let address = resolve_external_address("203.0.113.9", 8333).await.unwrap();
        assert_eq!(address.to_string(), "203.0.113.9:8333");
    }
}

//! Network addresses as they appear on the wire

use super::codec::{Decodable, Encodable, WireError, WireReader};
use bitflags::bitflags;
use bytes::BufMut;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Encoded size of a `NetworkAddress`
pub const NETWORK_ADDRESS_SIZE: usize = 26;

/// Encoded size of an `addr` entry (timestamp + address)
pub const TIMESTAMPED_ADDRESS_SIZE: usize = 4 + NETWORK_ADDRESS_SIZE;

bitflags! {
    /// Service bits advertised in `version` and `addr`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServiceFlags: u64 {
        /// Serves the full block chain
        const NETWORK = 1 << 0;
        const GETUTXO = 1 << 1;
        const BLOOM = 1 << 2;
        const WITNESS = 1 << 3;
        const XTHIN = 1 << 4;
        /// Bitcoin Cash node
        const BITCOIN_CASH = 1 << 5;
        const COMPACT_FILTERS = 1 << 6;
        /// Serves only recent blocks
        const NETWORK_LIMITED = 1 << 10;
    }
}

/// Services + IPv6 (or IPv4-mapped) address + port
///
/// Two addresses are equal when their ip and port match; services are
/// advisory and do not take part in identity.
#[derive(Debug, Clone, Copy)]
pub struct NetworkAddress {
    pub services: ServiceFlags,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(services: ServiceFlags, ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self { services, ip, port }
    }

    /// All-zero address used when a field is absent
    pub fn unspecified() -> Self {
        Self {
            services: ServiceFlags::empty(),
            ip: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.services.is_empty() && self.ip.is_unspecified() && self.port == 0
    }

    /// Parse `a.b.c.d`, `a.b.c.d:port`, a bare IPv6 address or `[v6]:port`
    pub fn parse(input: &str, default_port: u16) -> Result<Self, WireError> {
        let input = input.trim();
        if let Ok(socket) = input.parse::<SocketAddr>() {
            return Ok(Self::from(socket));
        }
        if let Ok(ip) = input.parse::<IpAddr>() {
            return Ok(Self::new(ServiceFlags::empty(), ip, default_port));
        }
        Err(WireError::InvalidData(format!("invalid address '{}'", input)))
    }

    pub fn with_services(mut self, services: ServiceFlags) -> Self {
        self.services = services;
        self
    }

    /// Plain IPv4 when the address is IPv4-mapped
    pub fn ip_addr(&self) -> IpAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(ServiceFlags::empty(), addr.ip(), addr.port())
    }
}

impl PartialEq for NetworkAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for NetworkAddress {}

impl Hash for NetworkAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl Encodable for NetworkAddress {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.services.bits());
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.port);
    }
}

impl Decodable for NetworkAddress {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let services = ServiceFlags::from_bits_retain(reader.read_u64_le("address services")?);
        let ip = Ipv6Addr::from(reader.read_array::<16>("address ip")?);
        let port = reader.read_u16_be("address port")?;
        Ok(Self { services, ip, port })
    }
}

/// An `addr` entry: last-seen time plus address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub timestamp: u32,
    pub address: NetworkAddress,
}

impl Encodable for TimestampedAddress {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.timestamp);
        self.address.encode(buf);
    }
}

impl Decodable for TimestampedAddress {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let timestamp = reader.read_u32_le("address timestamp")?;
        let address = NetworkAddress::decode(reader)?;
        Ok(Self { timestamp, address })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_ipv4_normalizes_to_mapped() {
        let addr = NetworkAddress::parse("192.168.1.20", 8333).unwrap();
        assert_eq!(addr.ip, "::ffff:192.168.1.20".parse::<Ipv6Addr>().unwrap());
        assert_eq!(addr.port, 8333);
        assert_eq!(addr.to_string(), "192.168.1.20:8333");

        let with_port = NetworkAddress::parse("10.0.0.1:18333", 8333).unwrap();
        assert_eq!(with_port.port, 18333);
        assert_eq!(
            with_port.ip_addr(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn test_parse_ipv6_forms() {
        let bare = NetworkAddress::parse("2001:db8::1", 8333).unwrap();
        assert_eq!(bare.port, 8333);
        assert_eq!(bare.to_string(), "[2001:db8::1]:8333");

        let bracketed = NetworkAddress::parse("[2001:db8::1]:9000", 8333).unwrap();
        assert_eq!(bracketed.port, 9000);
        assert_eq!(bracketed.ip, bare.ip);

        assert!(NetworkAddress::parse("not-an-address", 8333).is_err());
    }

    #[test]
    fn test_identity_ignores_services() {
        let a = NetworkAddress::parse("1.2.3.4:8333", 0).unwrap();
        let b = a.with_services(ServiceFlags::NETWORK | ServiceFlags::BITCOIN_CASH);
        assert_eq!(a, b);

        let c = NetworkAddress::parse("1.2.3.4:8334", 0).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_wire_layout() {
        let addr = NetworkAddress::parse("127.0.0.1:8333", 0)
            .unwrap()
            .with_services(ServiceFlags::NETWORK);
        let bytes = addr.to_bytes();

        assert_eq!(bytes.len(), NETWORK_ADDRESS_SIZE);
        assert_eq!(&bytes[..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..20], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(&bytes[20..24], &[127, 0, 0, 1]);
        // Port is big-endian
        assert_eq!(&bytes[24..], &[0x20, 0x8D]);

        let decoded = NetworkAddress::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(decoded.services, ServiceFlags::NETWORK);
    }

    #[test]
    fn test_unknown_service_bits_retained() {
        let mut bytes = NetworkAddress::unspecified().to_bytes();
        bytes[7] = 0x80;
        let decoded = NetworkAddress::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.services.bits(), 0x80 << 56);
        assert_eq!(decoded.to_bytes(), bytes);
    }
}

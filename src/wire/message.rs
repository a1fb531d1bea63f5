//! Control-message payloads
//!
//! Each payload type encodes and decodes symmetrically. `Message` ties a
//! decoded payload to the command it arrived under.

use super::address::{NetworkAddress, ServiceFlags, TimestampedAddress, TIMESTAMPED_ADDRESS_SIZE};
use super::codec::{write_var_str, write_varint, Decodable, Encodable, WireError, WireReader};
use super::command::Command;
use crate::chain::{BlockHash, BlockHeader, WIRE_HEADER_SIZE};
use bytes::{BufMut, Bytes};

// =============================================================================
// Payload Limits
// =============================================================================

/// Most entries accepted in one `addr`
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Most headers accepted in one `headers`
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

/// Most locator hashes accepted in one `getheaders`
pub const MAX_LOCATOR_HASHES: usize = 2000;

/// Longest user agent we'll read
pub const MAX_USER_AGENT_LEN: usize = 256;

/// Read a list count and check it against the bytes actually present
fn read_count(
    reader: &mut WireReader<'_>,
    what: &'static str,
    element_size: usize,
    trailing: usize,
    max: usize,
) -> Result<usize, WireError> {
    let count = reader.read_varint(what)?;
    if count > max as u64 {
        return Err(WireError::Oversized {
            what,
            size: count,
            max: max as u64,
        });
    }
    let count = count as usize;
    if reader.remaining() != count * element_size + trailing {
        return Err(WireError::CountMismatch {
            what,
            declared: count as u64,
            available: reader.remaining(),
        });
    }
    Ok(count)
}

// =============================================================================
// Version
// =============================================================================

/// `version` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub receiver: NetworkAddress,
    /// Zero-filled on the wire when absent
    pub emitter: Option<NetworkAddress>,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// Trailing flag, omitted by older peers
    pub relay: Option<bool>,
}

impl Encodable for VersionMessage {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services.bits());
        buf.put_i64_le(self.timestamp);
        self.receiver.encode(buf);
        self.emitter
            .unwrap_or_else(NetworkAddress::unspecified)
            .encode(buf);
        buf.put_u64_le(self.nonce);
        write_var_str(buf, &self.user_agent);
        buf.put_i32_le(self.start_height);
        if let Some(relay) = self.relay {
            buf.put_u8(relay as u8);
        }
    }
}

impl Decodable for VersionMessage {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let version = reader.read_i32_le("version")?;
        let services = ServiceFlags::from_bits_retain(reader.read_u64_le("version services")?);
        let timestamp = reader.read_i64_le("version timestamp")?;
        let receiver = NetworkAddress::decode(reader)?;

        let mut message = Self {
            version,
            services,
            timestamp,
            receiver,
            emitter: None,
            nonce: 0,
            user_agent: String::new(),
            start_height: 0,
            relay: None,
        };

        // Very old peers stop after the receiving address
        if reader.is_empty() {
            return Ok(message);
        }

        let emitter = NetworkAddress::decode(reader)?;
        message.emitter = (!emitter.is_unspecified()).then_some(emitter);
        message.nonce = reader.read_u64_le("version nonce")?;
        message.user_agent = reader.read_var_str(MAX_USER_AGENT_LEN, "user agent")?;
        message.start_height = reader.read_i32_le("start height")?;
        if !reader.is_empty() {
            message.relay = Some(reader.read_u8("relay")? != 0);
        }

        Ok(message)
    }
}

// =============================================================================
// GetHeaders
// =============================================================================

/// `getheaders` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locators: Vec<BlockHash>,
    /// Zero means "as many as you'll send"
    pub stop_hash: BlockHash,
}

impl GetHeadersMessage {
    pub fn new(version: u32, locators: Vec<BlockHash>) -> Self {
        Self {
            version,
            locators,
            stop_hash: BlockHash::ZERO,
        }
    }
}

impl Encodable for GetHeadersMessage {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        let count = self.locators.len().min(MAX_LOCATOR_HASHES);
        buf.put_u32_le(self.version);
        write_varint(buf, count as u64);
        for hash in &self.locators[..count] {
            hash.encode(buf);
        }
        self.stop_hash.encode(buf);
    }
}

impl Decodable for GetHeadersMessage {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let version = reader.read_u32_le("getheaders version")?;
        let count = read_count(reader, "locator", 32, 32, MAX_LOCATOR_HASHES)?;
        let locators = (0..count)
            .map(|_| BlockHash::decode(reader))
            .collect::<Result<Vec<_>, _>>()?;
        let stop_hash = BlockHash::decode(reader)?;
        Ok(Self {
            version,
            locators,
            stop_hash,
        })
    }
}

// =============================================================================
// List payloads
// =============================================================================

fn encode_addr<B: BufMut>(entries: &[TimestampedAddress], buf: &mut B) {
    let count = entries.len().min(MAX_ADDR_PER_MESSAGE);
    write_varint(buf, count as u64);
    for entry in &entries[..count] {
        entry.encode(buf);
    }
}

fn decode_addr(reader: &mut WireReader<'_>) -> Result<Vec<TimestampedAddress>, WireError> {
    let count = read_count(
        reader,
        "addr",
        TIMESTAMPED_ADDRESS_SIZE,
        0,
        MAX_ADDR_PER_MESSAGE,
    )?;
    (0..count).map(|_| TimestampedAddress::decode(reader)).collect()
}

fn encode_headers<B: BufMut>(headers: &[BlockHeader], buf: &mut B) {
    let count = headers.len().min(MAX_HEADERS_PER_MESSAGE);
    write_varint(buf, count as u64);
    for header in &headers[..count] {
        header.encode(buf);
        // Transaction count
        buf.put_u8(0);
    }
}

fn decode_headers(reader: &mut WireReader<'_>) -> Result<Vec<BlockHeader>, WireError> {
    let count = read_count(
        reader,
        "headers",
        WIRE_HEADER_SIZE,
        0,
        MAX_HEADERS_PER_MESSAGE,
    )?;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = BlockHeader::decode(reader)?;
        let tx_count = reader.read_u8("header tx count")?;
        if tx_count != 0 {
            log::debug!("Skipping header {} carrying {} transactions", header.hash(), tx_count);
            continue;
        }
        headers.push(header);
    }
    Ok(headers)
}

fn decode_nonce(payload: &[u8]) -> Result<u64, WireError> {
    WireReader::new(payload).read_u64_le("nonce")
}

// =============================================================================
// Message
// =============================================================================

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<TimestampedAddress>),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<BlockHeader>),
    SendHeaders,
    /// Extended version, answered with `xverack` but otherwise ignored
    XVersion(Bytes),
    XVerack,
    /// Commands we accept but don't interpret (`inv`, `feefilter`, unknown ...)
    Other { command: Command, payload: Bytes },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::GetAddr => Command::GetAddr,
            Message::Addr(_) => Command::Addr,
            Message::GetHeaders(_) => Command::GetHeaders,
            Message::Headers(_) => Command::Headers,
            Message::SendHeaders => Command::SendHeaders,
            Message::XVersion(_) => Command::XVersion,
            Message::XVerack => Command::XVerack,
            Message::Other { command, .. } => *command,
        }
    }

    /// Write the payload (without the envelope header)
    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        match self {
            Message::Version(version) => version.encode(buf),
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::Addr(entries) => encode_addr(entries, buf),
            Message::GetHeaders(request) => request.encode(buf),
            Message::Headers(headers) => encode_headers(headers, buf),
            Message::XVersion(payload) | Message::Other { payload, .. } => buf.put_slice(payload),
            Message::Verack | Message::GetAddr | Message::SendHeaders | Message::XVerack => {}
        }
    }

    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_payload(&mut out);
        out
    }

    /// Interpret a payload received under `command`
    pub fn decode(command: Command, payload: Bytes) -> Result<Self, WireError> {
        let message = match command {
            Command::Version => Message::Version(VersionMessage::from_bytes(&payload)?),
            Command::Verack => Message::Verack,
            Command::Ping => Message::Ping(decode_nonce(&payload)?),
            Command::Pong => Message::Pong(decode_nonce(&payload)?),
            Command::GetAddr => Message::GetAddr,
            Command::Addr => Message::Addr(decode_addr(&mut WireReader::new(&payload))?),
            Command::GetHeaders => Message::GetHeaders(GetHeadersMessage::from_bytes(&payload)?),
            Command::Headers => Message::Headers(decode_headers(&mut WireReader::new(&payload))?),
            Command::SendHeaders => Message::SendHeaders,
            Command::XVersion => Message::XVersion(payload),
            Command::XVerack => Message::XVerack,
            Command::Inv
            | Command::SendCmpct
            | Command::FeeFilter
            | Command::ProtoConf
            | Command::Unknown => Message::Other { command, payload },
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::header::tests::{genesis_header, BLOCK_1_HEADER};
    use crate::wire::address::NETWORK_ADDRESS_SIZE;

    fn round_trip(message: Message) -> Message {
        let payload = Bytes::from(message.payload_bytes());
        Message::decode(message.command(), payload).unwrap()
    }

    fn sample_version() -> VersionMessage {
        VersionMessage {
            version: 70015,
            services: ServiceFlags::NETWORK | ServiceFlags::BITCOIN_CASH,
            timestamp: 1_700_000_000,
            receiver: NetworkAddress::parse("203.0.113.9:8333", 0).unwrap(),
            emitter: Some(
                NetworkAddress::parse("198.51.100.7:8333", 0)
                    .unwrap()
                    .with_services(ServiceFlags::NETWORK),
            ),
            nonce: 0xDEAD_BEEF_0BAD_F00D,
            user_agent: "/chainpeer:0.1.0/".to_string(),
            start_height: 812_345,
            relay: Some(true),
        }
    }

    #[test]
    fn test_version_round_trip() {
        let version = sample_version();
        assert_eq!(
            round_trip(Message::Version(version.clone())),
            Message::Version(version)
        );
    }

    #[test]
    fn test_version_optional_fields_absent() {
        let version = VersionMessage {
            emitter: None,
            relay: None,
            ..sample_version()
        };
        let bytes = version.to_bytes();
        // No trailing relay byte
        assert_eq!(bytes.len(), 4 + 8 + 8 + 26 + 26 + 8 + 1 + 17 + 4);
        assert_eq!(VersionMessage::from_bytes(&bytes).unwrap(), version);
    }

    #[test]
    fn test_version_relay_false() {
        let version = VersionMessage {
            relay: Some(false),
            ..sample_version()
        };
        assert_eq!(VersionMessage::from_bytes(&version.to_bytes()).unwrap(), version);
    }

    #[test]
    fn test_legacy_version_stops_after_receiver() {
        let full = sample_version().to_bytes();
        let legacy = &full[..4 + 8 + 8 + NETWORK_ADDRESS_SIZE];
        let decoded = VersionMessage::from_bytes(legacy).unwrap();
        assert_eq!(decoded.version, 70015);
        assert_eq!(decoded.emitter, None);
        assert_eq!(decoded.user_agent, "");
        assert_eq!(decoded.relay, None);
    }

    #[test]
    fn test_truncated_version_rejected() {
        let full = sample_version().to_bytes();
        assert!(VersionMessage::from_bytes(&full[..60]).is_err());
    }

    #[test]
    fn test_ping_pong_round_trip() {
        assert_eq!(round_trip(Message::Ping(42)), Message::Ping(42));
        assert_eq!(round_trip(Message::Pong(u64::MAX)), Message::Pong(u64::MAX));
        assert!(Message::decode(Command::Ping, Bytes::from_static(&[1, 2, 3])).is_err());
    }

    #[test]
    fn test_empty_payload_messages() {
        for message in [Message::Verack, Message::GetAddr, Message::SendHeaders, Message::XVerack] {
            assert!(message.payload_bytes().is_empty());
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn test_addr_round_trip() {
        let entries = vec![
            TimestampedAddress {
                timestamp: 1_700_000_000,
                address: NetworkAddress::parse("1.2.3.4:8333", 0)
                    .unwrap()
                    .with_services(ServiceFlags::NETWORK),
            },
            TimestampedAddress {
                timestamp: 1_700_000_100,
                address: NetworkAddress::parse("[2001:db8::2]:18333", 0).unwrap(),
            },
        ];
        assert_eq!(
            round_trip(Message::Addr(entries.clone())),
            Message::Addr(entries)
        );
    }

    #[test]
    fn test_addr_count_mismatch() {
        let entry = TimestampedAddress {
            timestamp: 1,
            address: NetworkAddress::parse("1.2.3.4:8333", 0).unwrap(),
        };
        let mut payload = Message::Addr(vec![entry]).payload_bytes();
        // Claim two entries while carrying one
        payload[0] = 2;
        let err = Message::decode(Command::Addr, Bytes::from(payload)).unwrap_err();
        assert!(matches!(err, WireError::CountMismatch { declared: 2, .. }));
    }

    #[test]
    fn test_addr_over_limit() {
        let mut payload = Vec::new();
        write_varint(&mut payload, (MAX_ADDR_PER_MESSAGE + 1) as u64);
        let err = Message::decode(Command::Addr, Bytes::from(payload)).unwrap_err();
        assert!(matches!(err, WireError::Oversized { .. }));
    }

    #[test]
    fn test_getheaders_round_trip() {
        let request = GetHeadersMessage {
            version: 70015,
            locators: vec![genesis_header().hash(), BlockHash([3; 32])],
            stop_hash: BlockHash([9; 32]),
        };
        let payload = Message::GetHeaders(request.clone()).payload_bytes();
        assert_eq!(payload.len(), 4 + 1 + 64 + 32);
        assert_eq!(
            round_trip(Message::GetHeaders(request.clone())),
            Message::GetHeaders(request)
        );
    }

    #[test]
    fn test_getheaders_count_mismatch() {
        let mut payload = Message::GetHeaders(GetHeadersMessage::new(70015, vec![BlockHash::ZERO]))
            .payload_bytes();
        payload.truncate(payload.len() - 1);
        assert!(Message::decode(Command::GetHeaders, Bytes::from(payload)).is_err());
    }

    #[test]
    fn test_headers_round_trip() {
        let block1 = BlockHeader::from_bytes(&BLOCK_1_HEADER).unwrap();
        let headers = vec![genesis_header(), block1];
        let payload = Message::Headers(headers.clone()).payload_bytes();
        assert_eq!(payload.len(), 1 + 2 * WIRE_HEADER_SIZE);
        assert_eq!(
            round_trip(Message::Headers(headers.clone())),
            Message::Headers(headers)
        );
    }

    #[test]
    fn test_headers_with_transactions_skipped() {
        let block1 = BlockHeader::from_bytes(&BLOCK_1_HEADER).unwrap();
        let mut payload = Message::Headers(vec![genesis_header(), block1]).payload_bytes();
        // Non-zero tx count on the first entry
        payload[1 + 80] = 1;
        match Message::decode(Command::Headers, Bytes::from(payload)).unwrap() {
            Message::Headers(headers) => assert_eq!(headers, vec![block1]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unhandled_commands_are_preserved() {
        let payload = Bytes::from_static(&[1, 2, 3, 4]);
        let decoded = Message::decode(Command::Unknown, payload.clone()).unwrap();
        assert_eq!(
            decoded,
            Message::Other {
                command: Command::Unknown,
                payload: payload.clone()
            }
        );
        assert_eq!(decoded.payload_bytes(), payload.to_vec());
        assert_eq!(
            Message::decode(Command::Inv, payload.clone()).unwrap().command(),
            Command::Inv
        );
    }
}

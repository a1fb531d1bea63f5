//! Bitcoin-family wire protocol
//!
//! Pure encoding and decoding, no I/O:
//! - Primitive integers, varints and strings
//! - Envelope framing with magic and checksum
//! - Control-message payloads (version, ping, addr, headers ...)

pub mod address;
pub mod codec;
pub mod command;
pub mod envelope;
pub mod message;

pub use address::{
    NetworkAddress, ServiceFlags, TimestampedAddress, NETWORK_ADDRESS_SIZE,
    TIMESTAMPED_ADDRESS_SIZE,
};
pub use codec::{
    varint_len, write_var_str, write_varint, Decodable, Encodable, WireError, WireReader,
};
pub use command::{Command, COMMAND_SIZE};
pub use envelope::{decode_frame, Envelope, FrameRejection, MessageCodec, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    GetHeadersMessage, Message, VersionMessage, MAX_ADDR_PER_MESSAGE, MAX_HEADERS_PER_MESSAGE,
    MAX_LOCATOR_HASHES, MAX_USER_AGENT_LEN,
};

//! Message envelope and stream framing
//!
//! Every message travels as a 24-byte header (magic, command, length,
//! checksum) followed by its payload. `decode_frame` slices one envelope
//! off the front of a buffer; `MessageCodec` drives it over a byte stream.

use super::codec::WireError;
use super::command::{Command, COMMAND_SIZE};
use super::message::Message;
use crate::crypto::checksum;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Envelope header size
pub const HEADER_SIZE: usize = 24;

/// Largest payload we'll buffer
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Command plus raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub command: Command,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn from_message(message: &Message) -> Self {
        Self::new(message.command(), message.payload_bytes())
    }

    /// Write header and payload for the network identified by `magic`
    pub fn encode<B: BufMut>(&self, magic: u32, buf: &mut B) {
        buf.put_u32(magic);
        buf.put_slice(&self.command.to_field());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&checksum(&self.payload));
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self, magic: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode(magic, &mut out);
        out
    }

    pub fn into_message(self) -> Result<Message, WireError> {
        Message::decode(self.command, self.payload)
    }
}

/// A frame that can't be used, and how many bytes to drop to get past it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRejection {
    pub error: WireError,
    pub discard: usize,
}

/// Try to slice one envelope off the front of `buf`
///
/// `Ok(None)` means more bytes are needed. On success the consumed byte
/// count is returned alongside the envelope.
pub fn decode_frame(buf: &[u8], magic: u32) -> Result<Option<(Envelope, usize)>, FrameRejection> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &buf[..HEADER_SIZE];
    let found = header.get_u32();
    if found != magic {
        return Err(FrameRejection {
            error: WireError::BadMagic {
                expected: magic,
                found,
            },
            discard: resync_offset(buf, magic),
        });
    }

    let mut field = [0u8; COMMAND_SIZE];
    header.copy_to_slice(&mut field);
    let command = Command::from_field(&field);
    let length = header.get_u32_le() as usize;
    let mut expected = [0u8; 4];
    header.copy_to_slice(&mut expected);

    if length > MAX_PAYLOAD_SIZE {
        return Err(FrameRejection {
            error: WireError::Oversized {
                what: "payload",
                size: length as u64,
                max: MAX_PAYLOAD_SIZE as u64,
            },
            discard: HEADER_SIZE,
        });
    }

    let total = HEADER_SIZE + length;
    if buf.len() < total {
        return Ok(None);
    }

    let payload = &buf[HEADER_SIZE..total];
    if checksum(payload) != expected {
        return Err(FrameRejection {
            error: WireError::BadChecksum {
                command: command.to_string(),
            },
            discard: total,
        });
    }

    Ok(Some((
        Envelope::new(command, Bytes::copy_from_slice(payload)),
        total,
    )))
}

/// Bytes to skip so the buffer starts at the next possible magic
fn resync_offset(buf: &[u8], magic: u32) -> usize {
    let magic = magic.to_be_bytes();
    if let Some(pos) = buf[1..].windows(4).position(|w| w == magic) {
        return pos + 1;
    }
    // Keep a tail that could be the start of a split magic
    for keep in (1..4).rev() {
        if buf.len() > keep && buf[buf.len() - keep..] == magic[..keep] {
            return buf.len() - keep;
        }
    }
    buf.len()
}

/// Frames `Message`s for one network
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    magic: u32,
}

impl MessageCodec {
    pub fn new(magic: u32) -> Self {
        Self { magic }
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let envelope = Envelope::from_message(&item);
        dst.reserve(HEADER_SIZE + envelope.payload.len());
        envelope.encode(self.magic, dst);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Bad frames are dropped and decoding carries on with what follows
        loop {
            match decode_frame(&src[..], self.magic) {
                Ok(None) => return Ok(None),
                Ok(Some((envelope, consumed))) => {
                    src.advance(consumed);
                    let command = envelope.command;
                    match envelope.into_message() {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => log::warn!("Dropping malformed '{}' payload: {}", command, e),
                    }
                }
                Err(rejection) => {
                    log::warn!(
                        "Dropping {} bytes of bad frame: {}",
                        rejection.discard,
                        rejection.error
                    );
                    src.advance(rejection.discard);
                }
            }
        }
    }
}

//! Primitive wire encoding
//!
//! Little-endian fixed-width integers, Bitcoin-style variable-length
//! integers and strings, plus the `Encodable`/`Decodable` pair every
//! payload type implements.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Errors raised while decoding wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated {context}: needed {needed} bytes, {available} available")]
    Truncated {
        context: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("Bad magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("Checksum mismatch for '{command}'")]
    BadChecksum { command: String },
    #[error("Declared {what} count {declared} does not match {available} payload bytes")]
    CountMismatch {
        what: &'static str,
        declared: u64,
        available: usize,
    },
    #[error("{what} too large: {size}, max {max}")]
    Oversized {
        what: &'static str,
        size: u64,
        max: u64,
    },
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Types that can be written to the wire
pub trait Encodable {
    fn encode<B: BufMut>(&self, buf: &mut B);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Types that can be read back from the wire
pub trait Decodable: Sized {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        Self::decode(&mut reader)
    }
}

/// Bounds-checked cursor over a payload slice
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize, context: &'static str) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            return Err(WireError::Truncated {
                context,
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self, context: &'static str) -> Result<u8, WireError> {
        self.ensure(1, context)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16_le(&mut self, context: &'static str) -> Result<u16, WireError> {
        self.ensure(2, context)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u16_be(&mut self, context: &'static str) -> Result<u16, WireError> {
        self.ensure(2, context)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32_le(&mut self, context: &'static str) -> Result<u32, WireError> {
        self.ensure(4, context)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i32_le(&mut self, context: &'static str) -> Result<i32, WireError> {
        self.ensure(4, context)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_u64_le(&mut self, context: &'static str) -> Result<u64, WireError> {
        self.ensure(8, context)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i64_le(&mut self, context: &'static str) -> Result<i64, WireError> {
        self.ensure(8, context)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_array<const N: usize>(
        &mut self,
        context: &'static str,
    ) -> Result<[u8; N], WireError> {
        self.ensure(N, context)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize, context: &'static str) -> Result<&'a [u8], WireError> {
        self.ensure(len, context)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read a Bitcoin-style variable-length integer
    pub fn read_varint(&mut self, context: &'static str) -> Result<u64, WireError> {
        match self.read_u8(context)? {
            0xFD => Ok(self.read_u16_le(context)? as u64),
            0xFE => Ok(self.read_u32_le(context)? as u64),
            0xFF => self.read_u64_le(context),
            n => Ok(n as u64),
        }
    }

    /// Read a varint-prefixed string, rejecting anything longer than `max_len`
    pub fn read_var_str(
        &mut self,
        max_len: usize,
        context: &'static str,
    ) -> Result<String, WireError> {
        let len = self.read_varint(context)?;
        if len > max_len as u64 {
            return Err(WireError::Oversized {
                what: context,
                size: len,
                max: max_len as u64,
            });
        }
        let bytes = self.read_bytes(len as usize, context)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Write a Bitcoin-style variable-length integer
pub fn write_varint<B: BufMut>(buf: &mut B, value: u64) {
    if value < 0xFD {
        buf.put_u8(value as u8);
    } else if value <= 0xFFFF {
        buf.put_u8(0xFD);
        buf.put_u16_le(value as u16);
    } else if value <= 0xFFFF_FFFF {
        buf.put_u8(0xFE);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(0xFF);
        buf.put_u64_le(value);
    }
}

/// Encoded size of a varint
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Write a varint-prefixed string
pub fn write_var_str<B: BufMut>(buf: &mut B, value: &str) {
    write_varint(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, value);
        out
    }

    #[test]
    fn test_varint_boundaries() {
        let cases: [(u64, &[u8]); 6] = [
            (0, &[0x00]),
            (252, &[0xFC]),
            (253, &[0xFD, 0xFD, 0x00]),
            (65535, &[0xFD, 0xFF, 0xFF]),
            (65536, &[0xFE, 0x00, 0x00, 0x01, 0x00]),
            (u32::MAX as u64, &[0xFE, 0xFF, 0xFF, 0xFF, 0xFF]),
        ];

        for (value, expected) in cases {
            let bytes = varint_bytes(value);
            assert_eq!(bytes, expected, "encoding {}", value);
            assert_eq!(varint_len(value), bytes.len());

            let mut reader = WireReader::new(&bytes);
            assert_eq!(reader.read_varint("test").unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_varint_eight_byte_form() {
        let value = u32::MAX as u64 + 1;
        let bytes = varint_bytes(value);
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(bytes.len(), 9);
        assert_eq!(WireReader::new(&bytes).read_varint("test").unwrap(), value);
    }

    #[test]
    fn test_truncated_read() {
        let bytes = [0xFD, 0x01];
        let err = WireReader::new(&bytes).read_varint("count").unwrap_err();
        assert!(matches!(err, WireError::Truncated { context: "count", .. }));
    }

    #[test]
    fn test_var_str() {
        let mut out = Vec::new();
        write_var_str(&mut out, "/chainpeer:0.1.0/");
        let mut reader = WireReader::new(&out);
        assert_eq!(
            reader.read_var_str(256, "user agent").unwrap(),
            "/chainpeer:0.1.0/"
        );

        let mut reader = WireReader::new(&out);
        assert!(matches!(
            reader.read_var_str(4, "user agent"),
            Err(WireError::Oversized { .. })
        ));
    }
}

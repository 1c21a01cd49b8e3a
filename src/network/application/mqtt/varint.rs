//! Remaining-length codec.
//!
//! The remaining length is encoded in 1 to 4 bytes, 7 bits per byte, least
//! significant group first; bit 7 flags that another byte follows. The
//! largest encodable value is 268,435,455 (`0xFF 0xFF 0xFF 0x7F`).

use super::error::{ConfigError, Error, ProtocolError};
use heapless::Vec;

/// Longest encoding in bytes.
pub const MAX_LEN: usize = 4;

/// First value that no longer fits in four bytes.
pub const LIMIT: usize = 1 << 28;

/// Encoded remaining length.
pub type Encoded = Vec<u8, MAX_LEN>;

/// Encode `value`, failing for values of 2^28 and above.
pub fn encode(mut value: usize) -> Result<Encoded, Error> {
    if value >= LIMIT {
        return Err(ConfigError::MessageTooLong.into());
    }
    let mut out = Encoded::new();
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte).map_err(|_| ConfigError::MessageTooLong)?;
        if value == 0 {
            return Ok(out);
        }
    }
}

/// Incremental decoder fed one byte at a time as bytes arrive off the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct Decoder {
    value: usize,
    count: usize,
}

impl Decoder {
    /// A decoder that has seen no bytes yet.
    pub const fn new() -> Self {
        Self { value: 0, count: 0 }
    }

    /// Feed the next byte. Returns the decoded value once the final byte is seen.
    pub fn push(&mut self, byte: u8) -> Result<Option<usize>, Error> {
        if self.count == MAX_LEN {
            return Err(ProtocolError::MalformedLength.into());
        }
        self.value |= ((byte & 0x7f) as usize) << (7 * self.count);
        self.count += 1;
        if byte & 0x80 == 0 {
            Ok(Some(self.value))
        } else if self.count == MAX_LEN {
            Err(ProtocolError::MalformedLength.into())
        } else {
            Ok(None)
        }
    }
}

/// Decode a complete remaining length from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed, or `Ok(None)` when
/// `bytes` ends before the final length byte.
pub fn decode(bytes: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    let mut decoder = Decoder::new();
    for (i, &byte) in bytes.iter().enumerate() {
        if let Some(value) = decoder.push(byte)? {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

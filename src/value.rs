//! Length-prefixed value framing.
//!
//! A payload is stored as its length, written as a base-128 varint with the
//! continuation flag in the high bit of each byte, directly followed by the
//! payload bytes. Lengths are 32-bit, so a prefix is never longer than
//! [`MAX_VARINT_LEN`] bytes.

use crate::error::{Error, Result};

/// Maximum encoded size of a 32-bit length
pub const MAX_VARINT_LEN: usize = 5;

/// Stateless codec for length-prefixed byte payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueCodec;

impl ValueCodec {
    /// Number of bytes `value` takes once encoded.
    pub fn encoded_len(value: u32) -> usize {
        let mut size = 1;
        let mut v = value;
        while v >= 0x80 {
            size += 1;
            v >>= 7;
        }
        size
    }

    /// Append `value` to `out` 7 bits at a time, least significant group first.
    /// Returns the number of bytes written.
    pub fn write_varint(value: u32, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        let mut v = value;
        while v >= 0x80 {
            out.push((v & 0x7F) as u8 | 0x80);
            v >>= 7;
        }
        out.push(v as u8);
        out.len() - start
    }

    /// Read a varint from the front of `buf`.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn read_varint(buf: &[u8]) -> Result<(u32, usize)> {
        let mut value: u32 = 0;
        for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
            // Only the low 4 bits of the 5th byte fit in 32 bits.
            if i == MAX_VARINT_LEN - 1 && byte > 0x0F {
                return Err(Error::VarintOverflow);
            }
            value |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok((value, i + 1));
            }
        }
        Err(Error::Truncated {
            needed: buf.len() + 1,
            available: buf.len(),
        })
    }

    /// Append the length prefix and the payload to `out`.
    pub fn encode_into(payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| Error::BadValSize {
            what: "value",
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        out.reserve(Self::encoded_len(len) + payload.len());
        Self::write_varint(len, out);
        out.extend_from_slice(payload);
        Ok(())
    }

    /// Frame `payload` into a new buffer.
    pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        Self::encode_into(payload, &mut out)?;
        Ok(out)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the payload, borrowed from `buf`, and the total number of
    /// bytes the frame occupies.
    pub fn decode(buf: &[u8]) -> Result<(&[u8], usize)> {
        let (len, prefix) = Self::read_varint(buf)?;
        let len = len as usize;
        let rest = &buf[prefix..];
        if rest.len() < len {
            return Err(Error::Truncated {
                needed: len,
                available: rest.len(),
            });
        }
        Ok((&rest[..len], prefix + len))
    }
}

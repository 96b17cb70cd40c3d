//! Variable-length integer encoding (RFC 9000 Section 16).
//!
//! QUIC encodes integers in 1, 2, 4 or 8 bytes; the top two bits of the
//! first byte carry the length. HTTP-over-QUIC reuses this encoding for
//! stream-type prefaces, frame types and frame lengths, so the session core
//! needs it even though all framing proper is delegated to codecs.

use bytes::{Buf, BufMut};

/// Maximum value representable as a QUIC varint (2^62 - 1).
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// Decode a varint from a byte slice, returning `(value, bytes_consumed)`.
///
/// Returns `None` if the buffer does not hold a complete varint.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    match first >> 6 {
        0b00 => Some((u64::from(first & 0x3f), 1)),
        0b01 => {
            if buf.len() < 2 {
                return None;
            }
            Some(((u64::from(first & 0x3f) << 8) | u64::from(buf[1]), 2))
        }
        0b10 => {
            if buf.len() < 4 {
                return None;
            }
            let mut value = u64::from(first & 0x3f);
            for b in &buf[1..4] {
                value = (value << 8) | u64::from(*b);
            }
            Some((value, 4))
        }
        0b11 => {
            if buf.len() < 8 {
                return None;
            }
            let mut value = u64::from(first & 0x3f);
            for b in &buf[1..8] {
                value = (value << 8) | u64::from(*b);
            }
            Some((value, 8))
        }
        _ => unreachable!(),
    }
}

/// Decode a varint from a `Buf`, advancing past the consumed bytes.
///
/// Returns `None` without consuming anything if the buffer is incomplete.
/// The buffer's first chunk must cover the whole varint; `Bytes` and
/// `BytesMut` always satisfy this.
pub fn decode_buf<B: Buf>(buf: &mut B) -> Option<u64> {
    let (value, consumed) = decode(buf.chunk())?;
    buf.advance(consumed);
    Some(value)
}

/// Encode a varint into a `BufMut`, returning the encoded length.
///
/// Values above [`VARINT_MAX`] are not representable and return `None`.
pub fn encode<B: BufMut>(value: u64, buf: &mut B) -> Option<usize> {
    if value > VARINT_MAX {
        return None;
    }
    if value < 0x40 {
        buf.put_u8(value as u8);
        Some(1)
    } else if value < 0x4000 {
        buf.put_u16((value as u16) | 0x4000);
        Some(2)
    } else if value < 0x4000_0000 {
        buf.put_u32((value as u32) | 0x8000_0000);
        Some(4)
    } else {
        buf.put_u64(value | 0xc000_0000_0000_0000);
        Some(8)
    }
}

/// Encoded size of a value, without encoding it.
pub fn size(value: u64) -> usize {
    if value < 0x40 {
        1
    } else if value < 0x4000 {
        2
    } else if value < 0x4000_0000 {
        4
    } else {
        8
    }
}

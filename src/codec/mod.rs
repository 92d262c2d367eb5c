//! MQTT Wire Codec
//!
//! Encoding and decoding of the MQTT v3.1/v3.1.1 wire format: the
//! variable-length remaining-length field, UTF-8 string fields, and the
//! offset-based packet buffer with backward fixed-header construction.

mod packet;
mod recv;


pub use packet::{Packet, PacketId, PacketPool};
pub use recv::recv_packet;

use bytes::{BufMut, BytesMut};

use crate::protocol::{Error, Result, MAX_REMAINING_LENGTH, MAX_REMLEN_BYTES};

/// Decode a remaining-length value from the leading bytes of `buf`.
/// Returns (value, bytes consumed). Fails if 4 bytes are consumed
/// without the continuation bit clearing, or if the buffer runs out.
#[inline]
pub fn read_remaining_length(buf: &[u8]) -> Result<(u32, usize)> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= MAX_REMLEN_BYTES {
            return Err(Error::Content("remaining length exceeds 4 bytes"));
        }
        if pos >= buf.len() {
            return Err(Error::Content("truncated remaining length"));
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Encode a remaining-length value tail-first into a 4-byte scratch
/// area, so the encoded bytes abut whatever follows the scratch without
/// a second copy pass. Returns the number of trailing bytes used; the
/// encoding occupies `scratch[4 - n..]`.
#[inline]
pub fn write_remaining_length_tail(scratch: &mut [u8; MAX_REMLEN_BYTES], value: u32) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(Error::PacketLength);
    }

    let mut encoded = [0u8; MAX_REMLEN_BYTES];
    let mut remaining = value;
    let mut count = 0;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        encoded[count] = byte;
        count += 1;
        if remaining == 0 {
            break;
        }
    }

    // Encoded little-groups-first; lay them out in wire order at the tail.
    for i in 0..count {
        scratch[MAX_REMLEN_BYTES - count + i] = encoded[i];
    }

    Ok(count)
}

/// Number of bytes the remaining-length encoding of `value` occupies
#[inline]
pub fn remaining_length_size(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// Read a two-byte integer in network byte order
#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16> {
    if buf.len() < 2 {
        return Err(Error::Content("truncated 16-bit field"));
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read a UTF-8 string field: 2-byte big-endian length prefix followed
/// by that many bytes. Returns (string, bytes consumed). The declared
/// length is validated against the remaining buffer.
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize)> {
    if buf.len() < 2 {
        return Err(Error::Content("truncated string length"));
    }

    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total = 2 + len;

    if buf.len() < total {
        return Err(Error::Content("string length exceeds buffer"));
    }

    let s = std::str::from_utf8(&buf[2..total]).map_err(|_| Error::Content("invalid UTF-8"))?;

    Ok((s, total))
}

/// Read a length-prefixed binary field. Returns (data, bytes consumed).
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize)> {
    if buf.len() < 2 {
        return Err(Error::Content("truncated binary length"));
    }

    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total = 2 + len;

    if buf.len() < total {
        return Err(Error::Content("binary length exceeds buffer"));
    }

    Ok((&buf[2..total], total))
}

/// Write a UTF-8 string field into a response scratch buffer
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::Content("string too long"));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

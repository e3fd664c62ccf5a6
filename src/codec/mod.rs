//! MQTT Packet Codec
//!
//! Framing for every MQTT v3.1.1 packet type plus full encode/decode of the
//! connection lifecycle packets. All decode functions are pure functions
//! over a byte slice.

mod decode;
mod encode;


pub use decode::{decode_connack, decode_connect, decode_disconnect, decode_packet, Decoder};
pub use encode::{encode_connack, encode_connect, encode_disconnect, encode_packet};

use crate::protocol::{DecodeError, EncodeError, PacketType};
use bytes::{BufMut, BytesMut};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default maximum packet size accepted by the streaming decoder
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024; // 1 MB default

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    /// Length of everything after the fixed header
    pub remaining_length: u32,
    /// Length of the fixed header itself (2 to 5 bytes)
    pub header_len: usize,
}

impl FixedHeader {
    /// Total size of the framed packet
    pub fn packet_len(&self) -> usize {
        self.header_len + self.remaining_length as usize
    }
}

/// Read the remaining length field
///
/// Returns `Ok(None)` when more bytes are needed to finish the field and
/// (value, bytes_consumed) once it is complete.
#[inline]
pub fn read_remaining_length(buf: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;

    for (pos, &byte) in buf.iter().enumerate() {
        if pos >= 4 {
            return Err(DecodeError::MalformedHeader("remaining length exceeds 4 bytes"));
        }

        value += ((byte & 0x7F) as u32) * multiplier;

        if (byte & 0x80) == 0 {
            return Ok(Some((value, pos + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(DecodeError::MalformedHeader("remaining length exceeds 4 bytes"));
    }
    Ok(None)
}

/// Parse the first byte of a packet into type and flags
#[inline]
fn parse_first_byte(byte: u8) -> Result<(PacketType, u8), DecodeError> {
    let packet_type = PacketType::from_u8(byte >> 4)
        .ok_or(DecodeError::MalformedHeader("reserved packet type"))?;
    Ok((packet_type, byte & 0x0F))
}

/// Decode the fixed header of a complete packet
///
/// Fails with `MalformedHeader` if the remaining length runs past four
/// bytes or the buffer is shorter than the length it declares.
pub fn decode_fixed_header(buf: &[u8]) -> Result<FixedHeader, DecodeError> {
    let first = *buf
        .first()
        .ok_or(DecodeError::MalformedHeader("empty buffer"))?;
    let (packet_type, flags) = parse_first_byte(first)?;

    let (remaining_length, len_bytes) = read_remaining_length(&buf[1..])?
        .ok_or(DecodeError::MalformedHeader("truncated remaining length"))?;

    let header = FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_len: 1 + len_bytes,
    };

    if buf.len() < header.packet_len() {
        return Err(DecodeError::MalformedHeader(
            "buffer shorter than remaining length",
        ));
    }

    Ok(header)
}

/// Write the remaining length field
/// Returns bytes written
#[inline]
pub fn write_remaining_length(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Read a Two Byte Integer (u16 big-endian)
#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::MalformedPayload("truncated two byte integer"));
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read a UTF-8 encoded string
/// Returns (string, bytes_consumed) or error
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, consumed) = read_binary(buf)?;

    let s = std::str::from_utf8(data)
        .map_err(|_| DecodeError::MalformedPayload("invalid UTF-8 string"))?;

    if s.contains('\0') {
        return Err(DecodeError::MalformedPayload("string contains null character"));
    }

    Ok((s, consumed))
}

/// Read length-prefixed binary data
/// Returns (data, bytes_consumed) or error
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let total_len = 2 + len;

    if buf.len() < total_len {
        return Err(DecodeError::MalformedPayload(
            "field length exceeds remaining payload",
        ));
    }

    Ok((&buf[2..total_len], total_len))
}

/// Write a UTF-8 encoded string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

/// Write length-prefixed binary data
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = data.len();
    if len > 65535 {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(len as u16);
    buf.put_slice(data);
    Ok(())
}

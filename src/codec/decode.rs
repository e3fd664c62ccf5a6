//! MQTT Packet Decoder
//!
//! Decodes CONNECT, CONNACK and DISCONNECT; frames everything else.

use bytes::Bytes;

use super::{
    decode_fixed_header, parse_first_byte, read_binary, read_remaining_length, read_string,
    read_u16, FixedHeader, MAX_REMAINING_LENGTH,
};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PacketType, QoS, RawPacket, ReturnCode, Will,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// Streaming packet decoder
///
/// Frames packets out of an accumulating read buffer and enforces the
/// maximum packet size before the body has arrived.
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum remaining length
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), or `None` if the packet is incomplete
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let (packet_type, flags) = parse_first_byte(first)?;

        let Some((remaining_length, len_bytes)) = read_remaining_length(&buf[1..])? else {
            return Ok(None);
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge {
                size: remaining_length as usize,
                max: self.max_packet_size,
            });
        }

        let header = FixedHeader {
            packet_type,
            flags,
            remaining_length,
            header_len: 1 + len_bytes,
        };
        let total_len = header.packet_len();

        // Wait for complete packet
        if buf.len() < total_len {
            return Ok(None);
        }

        let packet = decode_body(&header, &buf[header.header_len..total_len])?;
        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one complete packet, fixed header included
pub fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    let header = decode_fixed_header(buf)?;
    decode_body(&header, &buf[header.header_len..header.packet_len()])
}

fn decode_body(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    match header.packet_type {
        PacketType::Connect => {
            if header.flags != 0 {
                return Err(DecodeError::MalformedHeader("invalid CONNECT flags"));
            }
            Ok(Packet::Connect(Box::new(decode_connect(body)?)))
        }
        PacketType::ConnAck => Ok(Packet::ConnAck(decode_connack(header.flags, body)?)),
        PacketType::Disconnect => {
            decode_disconnect(header.flags, body)?;
            Ok(Packet::Disconnect)
        }
        packet_type => Ok(Packet::Other(RawPacket {
            packet_type,
            flags: header.flags,
            body: Bytes::copy_from_slice(body),
        })),
    }
}

/// Decode a CONNECT variable header and payload
///
/// The protocol name is checked before the level, and the level before
/// any flag, so a client speaking another protocol level always gets the
/// level error even when the rest of the packet would not parse.
pub fn decode_connect(payload: &[u8]) -> Result<Connect, DecodeError> {
    let mut pos = 0;

    // Protocol name
    let (protocol_name, len) = read_string(payload)?;
    pos += len;

    if protocol_name != PROTOCOL_NAME {
        return Err(DecodeError::ProtocolViolation("protocol name is not MQTT"));
    }

    // Protocol level
    let level = *payload
        .get(pos)
        .ok_or(DecodeError::MalformedPayload("missing protocol level"))?;
    pos += 1;

    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::UnsupportedVersion(level));
    }

    // Connect flags
    let connect_flags = *payload
        .get(pos)
        .ok_or(DecodeError::MalformedPayload("missing connect flags"))?;
    pos += 1;

    // [MQTT-3.1.2-3] Reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::ProtocolViolation("reserved connect flag set"));
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
    if !username_flag && password_flag {
        return Err(DecodeError::MalformedPayload("password without username"));
    }

    let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::MalformedPayload("will QoS 3"))?;

    // [MQTT-3.1.2-13] [MQTT-3.1.2-15]
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::MalformedPayload(
            "will QoS or retain set without will flag",
        ));
    }

    // Keep alive
    let keep_alive = read_u16(&payload[pos..])?;
    pos += 2;

    // Client ID
    let (client_id, len) = read_string(&payload[pos..])?;
    let client_id = client_id.to_string();
    pos += len;

    let will = if will_flag {
        let (topic, len) = read_string(&payload[pos..])?;
        let topic = topic.to_string();
        pos += len;

        let (will_payload, len) = read_binary(&payload[pos..])?;
        let will_payload = Bytes::copy_from_slice(will_payload);
        pos += len;

        Some(Will {
            topic,
            payload: will_payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (username, len) = read_string(&payload[pos..])?;
        let username = username.to_string();
        pos += len;
        Some(username)
    } else {
        None
    };

    let password = if password_flag {
        let (password, len) = read_binary(&payload[pos..])?;
        let password = Bytes::copy_from_slice(password);
        pos += len;
        Some(password)
    } else {
        None
    };

    if pos != payload.len() {
        return Err(DecodeError::MalformedPayload("trailing bytes after CONNECT payload"));
    }

    Ok(Connect {
        client_id,
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })
}

/// Decode a CONNACK variable header
pub fn decode_connack(flags: u8, payload: &[u8]) -> Result<ConnAck, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::MalformedHeader("invalid CONNACK flags"));
    }

    if payload.len() != 2 {
        return Err(DecodeError::MalformedPayload("CONNACK must be 2 bytes"));
    }

    let ack_flags = payload[0];
    if (ack_flags & 0xFE) != 0 {
        return Err(DecodeError::MalformedPayload("reserved CONNACK flags set"));
    }

    let return_code = ReturnCode::from_u8(payload[1])
        .ok_or(DecodeError::MalformedPayload("unknown CONNACK return code"))?;

    Ok(ConnAck {
        session_present: (ack_flags & 0x01) != 0,
        return_code,
    })
}

/// Validate a DISCONNECT packet
pub fn decode_disconnect(flags: u8, payload: &[u8]) -> Result<(), DecodeError> {
    if flags != 0 {
        return Err(DecodeError::MalformedHeader("invalid DISCONNECT flags"));
    }

    if !payload.is_empty() {
        return Err(DecodeError::MalformedPayload("DISCONNECT carries a payload"));
    }

    Ok(())
}

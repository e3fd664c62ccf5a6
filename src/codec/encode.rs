//! MQTT Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_remaining_length, write_string, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, ReturnCode, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// Encode a CONNACK
///
/// Session present is only reported alongside an accepted connection.
#[inline]
pub fn encode_connack(session_present: bool, return_code: ReturnCode) -> [u8; 4] {
    let ack_flags = if session_present && return_code.is_accepted() {
        0x01
    } else {
        0x00
    };
    [0x20, 0x02, ack_flags, return_code as u8]
}

/// Encode a DISCONNECT
#[inline]
pub fn encode_disconnect() -> [u8; 2] {
    [0xE0, 0x00]
}

/// Encode a CONNECT
pub fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // Protocol name, level, connect flags, keep alive
    let mut remaining_length = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;

    // Client ID
    remaining_length += 2 + packet.client_id.len();

    // Will message
    if let Some(ref will) = packet.will {
        remaining_length += 2 + will.topic.len();
        remaining_length += 2 + will.payload.len();
    }

    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }

    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    if remaining_length > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    // Fixed header
    buf.put_u8(0x10); // CONNECT type + flags (0001 0000)
    write_remaining_length(buf, remaining_length as u32)?;

    write_string(buf, PROTOCOL_NAME)?;
    buf.put_u8(PROTOCOL_LEVEL);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);

    write_string(buf, &packet.client_id)?;

    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }

    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }

    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

/// Encode any packet to the buffer
///
/// `Other` packets are re-framed with their original type, flags and body.
pub fn encode_packet(packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(p) => encode_connect(p, buf),
        Packet::ConnAck(ConnAck {
            session_present,
            return_code,
        }) => {
            buf.put_slice(&encode_connack(*session_present, *return_code));
            Ok(())
        }
        Packet::Disconnect => {
            buf.put_slice(&encode_disconnect());
            Ok(())
        }
        Packet::Other(raw) => {
            if raw.body.len() > MAX_REMAINING_LENGTH {
                return Err(EncodeError::PacketTooLarge);
            }
            buf.put_u8(((raw.packet_type as u8) << 4) | (raw.flags & 0x0F));
            write_remaining_length(buf, raw.body.len() as u32)?;
            buf.put_slice(&raw.body);
            Ok(())
        }
    }
}

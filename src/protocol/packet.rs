//! MQTT Packet Definitions

use bytes::Bytes;

use super::{PacketType, QoS, ReturnCode};

/// MQTT Packet
///
/// Only the connection lifecycle packets are decoded; everything else is
/// framed and handed on untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Disconnect,
    Other(RawPacket),
}

impl Packet {
    /// Get packet type
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Disconnect => PacketType::Disconnect,
            Packet::Other(raw) => raw.packet_type,
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier, empty to request a server-assigned one
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional, requires a username)
    pub password: Option<Bytes>,
    /// Will message (optional)
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Will message configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    /// Will topic
    pub topic: String,
    /// Will payload
    pub payload: Bytes,
    /// Will QoS
    pub qos: QoS,
    /// Will retain flag
    pub retain: bool,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAck {
    /// Session present flag
    pub session_present: bool,
    /// Return code
    pub return_code: ReturnCode,
}

/// A framed packet the handshake core does not interpret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Packet type from the high nibble of the first byte
    pub packet_type: PacketType,
    /// Flags from the low nibble of the first byte
    pub flags: u8,
    /// Everything after the remaining length field
    pub body: Bytes,
}

//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
///
/// Every variant is terminal for the connection that produced it, except
/// [`DecodeError::UnsupportedVersion`] which is answered with a CONNACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fixed header is unusable (bad remaining length, truncated frame, reserved type or flags)
    MalformedHeader(&'static str),
    /// Protocol name is not "MQTT" or the packet is not legal here
    ProtocolViolation(&'static str),
    /// Protocol level other than 4
    UnsupportedVersion(u8),
    /// Payload fields are inconsistent with the flags or the declared lengths
    MalformedPayload(&'static str),
    /// Remaining length exceeds the configured maximum
    PacketTooLarge { size: usize, max: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader(msg) => write!(f, "malformed header: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol level: {}", v),
            Self::MalformedPayload(msg) => write!(f, "malformed payload: {}", msg),
            Self::PacketTooLarge { size, max } => {
                write!(f, "packet too large: {} bytes (max {})", size, max)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length would exceed 268,435,455
    PacketTooLarge,
    /// String or binary field longer than 65,535 bytes
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// High-level protocol errors raised by the handshake state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    Decode(DecodeError),
    /// Encode error
    Encode(EncodeError),
    /// Protocol violation
    ProtocolViolation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}

//! CONNACK return codes (MQTT v3.1.1 section 3.2.2.3)

use std::fmt;

/// CONNACK return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0x00,
    /// The server does not support the requested protocol level
    UnacceptableProtocolVersion = 0x01,
    /// Client identifier is not allowed
    IdentifierRejected = 0x02,
    /// The MQTT service is unavailable
    ServerUnavailable = 0x03,
    /// Malformed username or password
    BadCredentials = 0x04,
    /// The client is not authorized to connect
    NotAuthorized = 0x05,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ReturnCode::Accepted),
            0x01 => Some(ReturnCode::UnacceptableProtocolVersion),
            0x02 => Some(ReturnCode::IdentifierRejected),
            0x03 => Some(ReturnCode::ServerUnavailable),
            0x04 => Some(ReturnCode::BadCredentials),
            0x05 => Some(ReturnCode::NotAuthorized),
            _ => None,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == ReturnCode::Accepted
    }

    /// Short name used as a metric label
    pub fn as_str(self) -> &'static str {
        match self {
            ReturnCode::Accepted => "accepted",
            ReturnCode::UnacceptableProtocolVersion => "unacceptable_protocol_version",
            ReturnCode::IdentifierRejected => "identifier_rejected",
            ReturnCode::ServerUnavailable => "server_unavailable",
            ReturnCode::BadCredentials => "bad_credentials",
            ReturnCode::NotAuthorized => "not_authorized",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), *self as u8)
    }
}

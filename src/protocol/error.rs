//! Codec and protocol errors

use std::fmt;

/// Reasons a byte stream is not a valid MQTT v3.1.1 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ends before the packet does; read more and retry
    InsufficientData,
    InvalidPacketType(u8),
    /// Remaining length longer than four bytes
    InvalidRemainingLength,
    InvalidProtocolName,
    /// Protocol level other than 4, answered with CONNACK 1
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Reserved fixed header flags set
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Over the configured `max_packet_size`
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("incomplete packet"),
            Self::InvalidPacketType(t) => write!(f, "unknown packet type {}", t),
            Self::InvalidRemainingLength => f.write_str("remaining length exceeds 4 bytes"),
            Self::InvalidProtocolName => f.write_str("protocol name is not MQTT"),
            Self::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            Self::InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            Self::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            Self::InvalidFlags => f.write_str("reserved flags set"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => f.write_str("packet exceeds maximum size"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length above 268,435,455
    PacketTooLarge,
    /// String or binary field above 65,535 bytes
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => f.write_str("packet exceeds remaining length limit"),
            Self::StringTooLong => f.write_str("field exceeds 65535 bytes"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Failures that close a connection after the packet decoded cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Encode(EncodeError),
    /// The client broke a rule of the protocol
    Violation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Violation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}

//! Codec error types
//!
//! Decode failures are terminal for a connection: the read loop tears the
//! stream down rather than trying to resynchronize mid-byte-stream.

use std::fmt;

/// Why a packet could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends mid-field; only returned for fields the fixed header
    /// promised were present
    InsufficientData,
    /// Control packet type nibble outside 1..=14
    InvalidPacketType(u8),
    /// Remaining-length varint runs past four bytes
    InvalidRemainingLength,
    /// CONNECT names a protocol this broker does not speak
    InvalidProtocolName,
    /// QoS bits decode to 3
    InvalidQoS(u8),
    /// A length-prefixed string is not UTF-8
    InvalidUtf8,
    /// Fixed-header flag bits are wrong for the packet type
    InvalidFlags,
    /// A structural rule was broken; the message names it
    MalformedPacket(&'static str),
    /// Remaining length exceeds the configured per-packet limit
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("packet body ends mid-field"),
            Self::InvalidPacketType(t) => write!(f, "unknown control packet type {}", t),
            Self::InvalidRemainingLength => f.write_str("remaining length is not a valid varint"),
            Self::InvalidProtocolName => f.write_str("unrecognized protocol name in CONNECT"),
            Self::InvalidQoS(q) => write!(f, "qos value {} out of range", q),
            Self::InvalidUtf8 => f.write_str("string field is not valid UTF-8"),
            Self::InvalidFlags => f.write_str("fixed header flags do not match the packet type"),
            Self::MalformedPacket(what) => write!(f, "malformed packet ({})", what),
            Self::PacketTooLarge => f.write_str("packet exceeds the size limit"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a packet could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Body would overflow the four-byte remaining-length encoding
    PacketTooLarge,
    /// A string or binary field is longer than its two-byte length prefix
    /// can express
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => f.write_str("packet body overflows the remaining-length encoding"),
            Self::StringTooLong => f.write_str("field longer than a two-byte length prefix allows"),
        }
    }
}

impl std::error::Error for EncodeError {}

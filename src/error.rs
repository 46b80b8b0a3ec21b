//! # Error Types
//!
//! This module defines the error types used throughout the crate. Codec and packet
//! failures are reported as [`ProtocolError`]; the async stream-reading path wraps
//! them together with transport failures in [`MqttError`].

use core::fmt;

/// The primary error enum for stream-level operations.
///
/// It is generic over the transport error type `T`, allowing it to wrap
/// specific errors from the underlying network transport (e.g., TCP, UART).
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// A protocol-level error occurred, indicating a violation of the MQTT specification.
    Protocol(ProtocolError),
    /// An operation timed out.
    Timeout,
}

impl<T> From<ProtocolError> for MqttError<T> {
    fn from(err: ProtocolError) -> Self {
        MqttError::Protocol(err)
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// The fixed header carried a packet type this client does not handle.
    InvalidPacketType(u8),
    /// A well-formed packet type that is consumed outside the session
    /// (CONNACK, SUBACK, UNSUBACK).
    UnexpectedPacketType(u8),
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// The remaining length used more than four bytes.
    MalformedRemainingLength,
    /// The value cannot be represented as a remaining length.
    RemainingLengthTooLarge(usize),
    /// The declared packet size exceeds the packet buffer capacity.
    PacketTooBig,
    /// The packet has not been fully assembled yet.
    IncompletePacket,
    /// The QoS bits in a publish header were `0b11`.
    InvalidQoS(u8),
    /// A string was not valid UTF-8.
    InvalidUtf8String,
    /// A string is longer than the 65535 bytes a length prefix can describe.
    StringTooLong,
    /// The packet buffer cannot hold the data being encoded.
    BufferTooSmall,
    /// The connection was closed by the broker.
    ConnectionClosed,
}

impl ProtocolError {
    /// Whether the connection must be rebuilt after this error.
    pub fn is_connection_fault(&self) -> bool {
        !matches!(self, ProtocolError::UnexpectedPacketType(_))
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidPacketType(code) => write!(f, "invalid packet type {}", code),
            ProtocolError::UnexpectedPacketType(code) => {
                write!(f, "packet type {} is not handled by the session", code)
            }
            ProtocolError::MalformedPacket => f.write_str("malformed packet"),
            ProtocolError::MalformedRemainingLength => {
                f.write_str("remaining length longer than 4 bytes")
            }
            ProtocolError::RemainingLengthTooLarge(len) => {
                write!(f, "remaining length {} exceeds 268435455", len)
            }
            ProtocolError::PacketTooBig => f.write_str("packet exceeds buffer capacity"),
            ProtocolError::IncompletePacket => f.write_str("packet is incomplete"),
            ProtocolError::InvalidQoS(bits) => write!(f, "invalid QoS level {}", bits),
            ProtocolError::InvalidUtf8String => f.write_str("string is not valid UTF-8"),
            ProtocolError::StringTooLong => f.write_str("string longer than 65535 bytes"),
            ProtocolError::BufferTooSmall => f.write_str("buffer too small"),
            ProtocolError::ConnectionClosed => f.write_str("connection closed"),
        }
    }
}

//! # MQTT Serialization Utilities
//!
//! This module provides helper functions for reading and writing MQTT-specific data types
//! from and to byte buffers, such as variable-byte integers and length-prefixed strings.

use crate::error::ProtocolError;
use heapless::Vec;

/// Largest value a four-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of bytes in an encoded remaining length.
pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Encodes `val` as a variable-byte integer into `out`, returning the byte count.
pub fn encode_variable_byte_integer(
    mut val: usize,
    out: &mut [u8; MAX_REMAINING_LENGTH_BYTES],
) -> Result<usize, ProtocolError> {
    if val > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::RemainingLengthTooLarge(val));
    }
    let mut i = 0;
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        out[i] = encoded_byte;
        i += 1;
        if val == 0 {
            break;
        }
    }
    Ok(i)
}

/// Appends `val` as a variable-byte integer.
pub fn write_variable_byte_integer<const N: usize>(
    buf: &mut Vec<u8, N>,
    val: usize,
) -> Result<(), ProtocolError> {
    let mut encoded = [0u8; MAX_REMAINING_LENGTH_BYTES];
    let len = encode_variable_byte_integer(val, &mut encoded)?;
    buf.extend_from_slice(&encoded[..len])
        .map_err(|_| ProtocolError::BufferTooSmall)
}

/// Reads a variable-byte integer from the buffer, advancing the cursor.
///
/// This is a common encoding scheme in MQTT for packet lengths.
pub fn read_variable_byte_integer(cursor: &mut usize, buf: &[u8]) -> Result<usize, ProtocolError> {
    let mut multiplier = 1;
    let mut value = 0;
    let mut i = 0;
    loop {
        let encoded_byte = buf
            .get(*cursor + i)
            .ok_or(ProtocolError::IncompletePacket)?;
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            break;
        }
        multiplier *= 128;
        i += 1;
        if i >= MAX_REMAINING_LENGTH_BYTES {
            return Err(ProtocolError::MalformedRemainingLength);
        }
    }
    *cursor += i + 1;
    Ok(value)
}

/// Appends a big-endian `u16`.
pub fn write_u16<const N: usize>(buf: &mut Vec<u8, N>, val: u16) -> Result<(), ProtocolError> {
    buf.extend_from_slice(&val.to_be_bytes())
        .map_err(|_| ProtocolError::BufferTooSmall)
}

/// Reads a big-endian `u16`, advancing the cursor.
pub fn read_u16(cursor: &mut usize, buf: &[u8]) -> Result<u16, ProtocolError> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(ProtocolError::MalformedPacket)?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Number of bytes `s` occupies once length-prefixed.
pub fn encoded_string_len(s: &str) -> usize {
    2 + s.len()
}

/// Appends a UTF-8 encoded string prefixed with its 2-byte length.
pub fn write_utf8_string<const N: usize>(buf: &mut Vec<u8, N>, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::StringTooLong)?;
    write_u16(buf, len)?;
    buf.extend_from_slice(s.as_bytes())
        .map_err(|_| ProtocolError::BufferTooSmall)
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
///
/// A declared length running past the end of `buf` is a malformed packet.
pub fn read_utf8_string<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a str, ProtocolError> {
    let mut pos = *cursor;
    let len = read_u16(&mut pos, buf)? as usize;
    let bytes = buf
        .get(pos..pos + len)
        .ok_or(ProtocolError::MalformedPacket)?;
    let s = core::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8String)?;
    *cursor = pos + len;
    Ok(s)
}

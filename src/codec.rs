//! # Incremental Packet Codec
//!
//! [`Packet`] is the byte buffer every control packet is built on. Inbound, it is a
//! small state machine that tells the reader exactly how many bytes to supply next
//! (`wanted_amount`), so a stream can be read without over-reading into the next
//! packet. Outbound, it holds a fully serialized packet ready to hand to a transport.
//!
//! Wire layout: one fixed-header byte (4-bit type, 4-bit flags), a 1-4 byte
//! remaining length, then `remaining_length` bytes of variable header and payload.

use crate::error::ProtocolError;
use crate::util::{self, MAX_REMAINING_LENGTH_BYTES};
use heapless::Vec;

/// MQTT control packet types, as carried in the upper nibble of the fixed header.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    /// Forbidden.
    #[default]
    Reserved = 0,
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    /// Forbidden in MQTT 3.1.1.
    Reserved15 = 15,
}

impl PacketType {
    /// Extracts the packet type from a fixed-header byte.
    pub const fn from_u8(byte: u8) -> Self {
        match byte >> 4 {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            15 => PacketType::Reserved15,
            _ => PacketType::Reserved,
        }
    }

    /// Protocol name of the packet type, for diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            PacketType::Reserved => "RESERVED",
            PacketType::Connect => "CONNECT",
            PacketType::ConnAck => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::PubAck => "PUBACK",
            PacketType::PubRec => "PUBREC",
            PacketType::PubRel => "PUBREL",
            PacketType::PubComp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::SubAck => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::UnsubAck => "UNSUBACK",
            PacketType::PingReq => "PINGREQ",
            PacketType::PingResp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::Reserved15 => "RESERVED",
        }
    }
}

/// Where the assembly of an inbound packet currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadState {
    /// Waiting for the fixed-header byte.
    Start,
    /// Reading the remaining length, one byte at a time.
    RemainingLength,
    /// Reading the variable header and payload.
    Data,
    /// All bytes are present.
    Complete,
    /// The remaining length was malformed.
    Error,
    /// The declared size does not fit the buffer.
    TooBig,
}

/// A control packet buffer with capacity `N`, which is also the largest packet
/// that can be decoded or encoded.
#[derive(Debug, Clone)]
pub struct Packet<const N: usize> {
    buf: Vec<u8, N>,
    state: ReadState,
    received: usize,
    wanted: usize,
    remaining_length: usize,
    header_len: usize,
    send_retry_count: u8,
}

impl<const N: usize> Default for Packet<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Packet<N> {
    /// Creates an empty packet ready to be assembled from a byte stream.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: ReadState::Start,
            received: 0,
            wanted: 1,
            remaining_length: 0,
            header_len: 0,
            send_retry_count: 0,
        }
    }

    /// Serializes a packet: fixed header, remaining length, then whatever `body`
    /// appends. `body` must append exactly `remaining_length` bytes.
    pub(crate) fn build<F>(
        fixed_header: u8,
        remaining_length: usize,
        body: F,
    ) -> Result<Self, ProtocolError>
    where
        F: FnOnce(&mut Vec<u8, N>) -> Result<(), ProtocolError>,
    {
        let mut buf = Vec::new();
        buf.push(fixed_header)
            .map_err(|_| ProtocolError::BufferTooSmall)?;
        util::write_variable_byte_integer(&mut buf, remaining_length)?;
        let header_len = buf.len();
        if header_len + remaining_length > N {
            return Err(ProtocolError::BufferTooSmall);
        }
        body(&mut buf)?;
        if buf.len() != header_len + remaining_length {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(Self::complete(buf, header_len, remaining_length))
    }

    /// Wraps an already serialized packet whose remaining length fits in one byte.
    pub(crate) fn from_array<const M: usize>(bytes: [u8; M]) -> Self {
        let remaining_length = M.saturating_sub(2);
        Self::complete(Vec::from_array(bytes), 2, remaining_length)
    }

    fn complete(buf: Vec<u8, N>, header_len: usize, remaining_length: usize) -> Self {
        Self {
            received: buf.len(),
            buf,
            state: ReadState::Complete,
            wanted: 0,
            remaining_length,
            header_len,
            send_retry_count: 0,
        }
    }

    /// Number of bytes the caller must supply next. Zero once the packet is
    /// complete or has failed.
    pub fn wanted_amount(&self) -> usize {
        self.wanted
    }

    /// Slice of exactly `wanted_amount()` bytes at the write cursor. Fill some
    /// prefix of it, then report the count through [`Packet::bytes_received`].
    pub fn write_slot(&mut self) -> &mut [u8] {
        let start = self.received;
        if self.buf.resize(start + self.wanted, 0).is_err() {
            return &mut [];
        }
        &mut self.buf[start..]
    }

    /// Records that `n` bytes were written into the slot from
    /// [`Packet::write_slot`] and advances the read state.
    pub fn bytes_received(&mut self, n: usize) {
        let n = n
            .min(self.wanted)
            .min(self.buf.len().saturating_sub(self.received));
        self.received += n;
        self.wanted -= n;
        self.buf.truncate(self.received);
        if self.wanted == 0 {
            self.advance();
        }
    }

    /// Copies as many bytes from `data` as the packet currently wants, repeating
    /// until `data` is exhausted or the packet stops wanting more. Returns the
    /// number of bytes consumed.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < data.len() && self.wanted > 0 {
            let slot = self.write_slot();
            if slot.is_empty() {
                break;
            }
            let n = slot.len().min(data.len() - consumed);
            slot[..n].copy_from_slice(&data[consumed..consumed + n]);
            self.bytes_received(n);
            consumed += n;
        }
        consumed
    }

    fn advance(&mut self) {
        match self.state {
            ReadState::Start => {
                self.state = ReadState::RemainingLength;
                self.wanted = 1;
            }
            ReadState::RemainingLength => {
                let length_bytes = self.buf.len() - 1;
                let last = self.buf[self.buf.len() - 1];
                if last & 0x80 != 0 {
                    if length_bytes >= MAX_REMAINING_LENGTH_BYTES {
                        warn!("remaining length exceeds 4 bytes");
                        self.fail(ReadState::Error);
                    } else {
                        self.wanted = 1;
                    }
                    return;
                }
                let mut cursor = 1;
                match util::read_variable_byte_integer(&mut cursor, &self.buf) {
                    Ok(len) => {
                        self.header_len = cursor;
                        self.remaining_length = len;
                        if cursor + len > N {
                            warn!("declared packet size {} exceeds capacity {}", cursor + len, N);
                            self.fail(ReadState::TooBig);
                        } else if len == 0 {
                            self.state = ReadState::Complete;
                        } else {
                            self.state = ReadState::Data;
                            self.wanted = len;
                        }
                    }
                    Err(_) => self.fail(ReadState::Error),
                }
            }
            ReadState::Data => self.state = ReadState::Complete,
            ReadState::Complete | ReadState::Error | ReadState::TooBig => {}
        }
    }

    fn fail(&mut self, state: ReadState) {
        self.state = state;
        self.wanted = 0;
    }

    /// Where inbound assembly currently stands.
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// All bytes of the packet are present.
    pub fn is_complete(&self) -> bool {
        self.state == ReadState::Complete
    }

    /// The packet can never be assembled; the connection must be rebuilt.
    pub fn is_error(&self) -> bool {
        matches!(self.state, ReadState::Error | ReadState::TooBig)
    }

    /// The declared size exceeded the buffer capacity.
    pub fn is_too_big(&self) -> bool {
        self.state == ReadState::TooBig
    }

    /// Packet type from the fixed header, `Reserved` if nothing was read yet.
    pub fn packet_type(&self) -> PacketType {
        self.buf
            .first()
            .map(|b| PacketType::from_u8(*b))
            .unwrap_or_default()
    }

    /// Lower nibble of the fixed header.
    pub fn flags(&self) -> u8 {
        self.buf.first().map(|b| b & 0x0F).unwrap_or(0)
    }

    pub(crate) fn set_flags(&mut self, flags: u8) {
        if let Some(first) = self.buf.first_mut() {
            *first = (*first & 0xF0) | (flags & 0x0F);
        }
    }

    /// Decoded remaining length; 0 until the length field is complete.
    pub fn remaining_length(&self) -> usize {
        self.remaining_length
    }

    /// Offset of the first byte after the fixed header.
    pub fn variable_header_start(&self) -> usize {
        self.header_len
    }

    /// The assembled or serialized bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes held so far, fixed header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// How many times this packet has been handed to a transport.
    pub fn send_retry_count(&self) -> u8 {
        self.send_retry_count
    }

    pub fn inc_send_retry_count(&mut self) {
        self.send_retry_count = self.send_retry_count.saturating_add(1);
    }

    /// Logs the packet bytes at trace level.
    pub fn dump(&self) {
        trace!(
            "{} ({} bytes): {:?}",
            self.packet_type().as_str(),
            self.buf.len(),
            self.as_bytes()
        );
    }
}

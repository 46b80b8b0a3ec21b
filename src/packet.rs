//! # MQTT Packet Structures and Serialization
//!
//! This module defines the concrete control packets handled by the client, all
//! built on the [`Packet`] codec, and the closed [`MqttPacket`] enum used to route
//! a fully assembled inbound packet to exactly one [`PacketReceiver`] method.
//!
//! Building (outbound) and parsing (inbound) are separate constructors on every
//! kind; both return a `Result`.

use crate::codec::{Packet, PacketType};
use crate::error::ProtocolError;
use crate::packet_id::PacketIdAllocator;
use crate::util::{self, encoded_string_len, read_u16, read_utf8_string};

const PUBLISH_RETAIN: u8 = 0x01;
const PUBLISH_QOS_SHIFT: u8 = 1;
const PUBLISH_QOS_MASK: u8 = 0x03;
const PUBLISH_DUP: u8 = 0x08;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub const fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQoS(value)),
        }
    }
}

/// A serialized control packet that can be handed to a transport.
pub trait ControlPacket {
    fn packet_type(&self) -> PacketType;

    /// The complete wire bytes.
    fn as_bytes(&self) -> &[u8];
}

impl<const N: usize> ControlPacket for Packet<N> {
    fn packet_type(&self) -> PacketType {
        Packet::packet_type(self)
    }

    fn as_bytes(&self) -> &[u8] {
        Packet::as_bytes(self)
    }
}

// --- PUBLISH Packet ---

/// A PUBLISH packet backed by a buffer of capacity `N`.
///
/// The topic, identifier and payload are read straight from the buffer; only
/// their offsets are cached.
#[derive(Debug, Clone)]
pub struct Publish<const N: usize> {
    packet: Packet<N>,
    qos: QoS,
    packet_id: Option<u16>,
    topic_end: usize,
    payload_start: usize,
}

impl<const N: usize> Publish<N> {
    /// Builds an outbound publish. An identifier is drawn from `ids` only when
    /// `qos` is above [`QoS::AtMostOnce`].
    pub fn build(
        ids: &mut PacketIdAllocator,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Self, ProtocolError> {
        if topic.len() > u16::MAX as usize {
            return Err(ProtocolError::StringTooLong);
        }

        let mut flags = (qos as u8) << PUBLISH_QOS_SHIFT;
        if retain {
            flags |= PUBLISH_RETAIN;
        }

        let id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
        let remaining_length = encoded_string_len(topic) + id_len + payload.len();

        let mut packet_id = None;
        let packet = Packet::build(
            (PacketType::Publish as u8) << 4 | flags,
            remaining_length,
            |buf| {
                util::write_utf8_string(buf, topic)?;
                if qos != QoS::AtMostOnce {
                    let id = ids.next_id();
                    util::write_u16(buf, id)?;
                    packet_id = Some(id);
                }
                buf.extend_from_slice(payload)
                    .map_err(|_| ProtocolError::BufferTooSmall)
            },
        )?;

        let topic_end = packet.variable_header_start() + encoded_string_len(topic);
        Ok(Self {
            qos,
            packet_id,
            topic_end,
            payload_start: topic_end + id_len,
            packet,
        })
    }

    /// Parses a fully assembled inbound packet.
    pub fn parse(packet: Packet<N>) -> Result<Self, ProtocolError> {
        if !packet.is_complete() {
            return Err(ProtocolError::IncompletePacket);
        }
        if packet.packet_type() != PacketType::Publish {
            return Err(ProtocolError::InvalidPacketType(packet.packet_type() as u8));
        }
        let qos = QoS::from_u8((packet.flags() >> PUBLISH_QOS_SHIFT) & PUBLISH_QOS_MASK)?;

        let buf = packet.as_bytes();
        let mut cursor = packet.variable_header_start();
        read_utf8_string(&mut cursor, buf)?;
        let topic_end = cursor;

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            match read_u16(&mut cursor, buf)? {
                0 => return Err(ProtocolError::MalformedPacket),
                id => Some(id),
            }
        };

        Ok(Self {
            qos,
            packet_id,
            topic_end,
            payload_start: cursor,
            packet,
        })
    }

    pub fn topic(&self) -> &str {
        let start = self.packet.variable_header_start() + 2;
        core::str::from_utf8(&self.packet.as_bytes()[start..self.topic_end]).unwrap_or_default()
    }

    pub fn payload(&self) -> &[u8] {
        &self.packet.as_bytes()[self.payload_start..]
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Present iff QoS is above [`QoS::AtMostOnce`].
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    pub fn retain(&self) -> bool {
        self.packet.flags() & PUBLISH_RETAIN != 0
    }

    pub fn dup(&self) -> bool {
        self.packet.flags() & PUBLISH_DUP != 0
    }

    /// Marks the packet as a redelivery. Only the flags byte changes.
    ///
    /// QoS 0 packets must never carry the flag, so the call is a no-op for them.
    pub fn set_dup_flag(&mut self) {
        if self.qos != QoS::AtMostOnce {
            let flags = self.packet.flags() | PUBLISH_DUP;
            self.packet.set_flags(flags);
        }
    }

    pub fn packet(&self) -> &Packet<N> {
        &self.packet
    }

    pub(crate) fn packet_mut(&mut self) -> &mut Packet<N> {
        &mut self.packet
    }
}

impl<const N: usize> ControlPacket for Publish<N> {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn as_bytes(&self) -> &[u8] {
        self.packet.as_bytes()
    }
}

// --- Acknowledgment packets ---

fn parse_ack<const N: usize>(packet: &Packet<N>, fixed_header: u8) -> Result<u16, ProtocolError> {
    if !packet.is_complete() {
        return Err(ProtocolError::IncompletePacket);
    }
    let first = packet.as_bytes()[0];
    if first >> 4 != fixed_header >> 4 {
        return Err(ProtocolError::InvalidPacketType(first >> 4));
    }
    if first != fixed_header || packet.remaining_length() != 2 {
        return Err(ProtocolError::MalformedPacket);
    }
    let mut cursor = packet.variable_header_start();
    read_u16(&mut cursor, packet.as_bytes())
}

macro_rules! ack_packet {
    ($(#[$doc:meta])* $name:ident, $kind:ident, $fixed_header:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            packet_id: u16,
            packet: Packet<4>,
        }

        impl $name {
            pub const FIXED_HEADER: u8 = $fixed_header;

            pub fn new(packet_id: u16) -> Self {
                let [msb, lsb] = packet_id.to_be_bytes();
                Self {
                    packet_id,
                    packet: Packet::from_array([Self::FIXED_HEADER, 0x02, msb, lsb]),
                }
            }

            pub fn parse<const N: usize>(packet: &Packet<N>) -> Result<Self, ProtocolError> {
                parse_ack(packet, Self::FIXED_HEADER).map(Self::new)
            }

            pub fn packet_id(&self) -> u16 {
                self.packet_id
            }
        }

        impl ControlPacket for $name {
            fn packet_type(&self) -> PacketType {
                PacketType::$kind
            }

            fn as_bytes(&self) -> &[u8] {
                self.packet.as_bytes()
            }
        }
    };
}

ack_packet!(
    /// QoS 1 publish acknowledgment.
    PubAck, PubAck, 0x40
);
ack_packet!(
    /// QoS 2 publish received (part 1).
    PubRec, PubRec, 0x50
);
ack_packet!(
    /// QoS 2 publish release (part 2). Carries the reserved flags `0b0010`.
    PubRel, PubRel, 0x62
);
ack_packet!(
    /// QoS 2 publish complete (part 3).
    PubComp, PubComp, 0x70
);

// --- Zero-payload packets ---

macro_rules! empty_packet {
    ($(#[$doc:meta])* $name:ident, $kind:ident, $fixed_header:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            packet: Packet<2>,
        }

        impl $name {
            pub const FIXED_HEADER: u8 = $fixed_header;

            pub fn new() -> Self {
                Self {
                    packet: Packet::from_array([Self::FIXED_HEADER, 0x00]),
                }
            }

            pub fn parse<const N: usize>(packet: &Packet<N>) -> Result<Self, ProtocolError> {
                if !packet.is_complete() {
                    return Err(ProtocolError::IncompletePacket);
                }
                if packet.packet_type() != PacketType::$kind {
                    return Err(ProtocolError::InvalidPacketType(packet.packet_type() as u8));
                }
                if packet.flags() != Self::FIXED_HEADER & 0x0F || packet.remaining_length() != 0 {
                    return Err(ProtocolError::MalformedPacket);
                }
                Ok(Self::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ControlPacket for $name {
            fn packet_type(&self) -> PacketType {
                PacketType::$kind
            }

            fn as_bytes(&self) -> &[u8] {
                self.packet.as_bytes()
            }
        }
    };
}

empty_packet!(
    /// Keep-alive request sent by the client.
    PingReq, PingReq, 0xC0
);
empty_packet!(
    /// Keep-alive response from the broker.
    PingResp, PingResp, 0xD0
);
empty_packet!(
    /// Graceful disconnect notification.
    Disconnect, Disconnect, 0xE0
);

// --- Dispatch ---

/// Handles each inbound packet kind. There are no default methods; every kind
/// must be handled explicitly.
pub trait PacketReceiver<const N: usize> {
    fn receive_publish(&mut self, publish: Publish<N>);
    fn receive_puback(&mut self, ack: PubAck);
    fn receive_pubrec(&mut self, rec: PubRec);
    fn receive_pubrel(&mut self, rel: PubRel);
    fn receive_pubcomp(&mut self, comp: PubComp);
    fn receive_pingresp(&mut self, resp: PingResp);
}

/// An enumeration of the inbound MQTT control packets the client handles.
#[derive(Debug, Clone)]
pub enum MqttPacket<const N: usize> {
    Publish(Publish<N>),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    PingResp(PingResp),
}

impl<const N: usize> MqttPacket<N> {
    /// Decodes a fully assembled packet into its concrete kind.
    ///
    /// Any type code outside the handled set is an error, never a silent skip.
    pub fn decode(packet: Packet<N>) -> Result<Self, ProtocolError> {
        if packet.is_too_big() {
            return Err(ProtocolError::PacketTooBig);
        }
        if packet.is_error() {
            return Err(ProtocolError::MalformedRemainingLength);
        }
        if !packet.is_complete() {
            return Err(ProtocolError::IncompletePacket);
        }

        let decoded = match packet.packet_type() {
            PacketType::Publish => MqttPacket::Publish(Publish::parse(packet)?),
            PacketType::PubAck => MqttPacket::PubAck(PubAck::parse(&packet)?),
            PacketType::PubRec => MqttPacket::PubRec(PubRec::parse(&packet)?),
            PacketType::PubRel => MqttPacket::PubRel(PubRel::parse(&packet)?),
            PacketType::PubComp => MqttPacket::PubComp(PubComp::parse(&packet)?),
            PacketType::PingResp => MqttPacket::PingResp(PingResp::parse(&packet)?),
            other @ (PacketType::ConnAck | PacketType::SubAck | PacketType::UnsubAck) => {
                return Err(ProtocolError::UnexpectedPacketType(other as u8));
            }
            other => return Err(ProtocolError::InvalidPacketType(other as u8)),
        };
        Ok(decoded)
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            MqttPacket::Publish(_) => PacketType::Publish,
            MqttPacket::PubAck(_) => PacketType::PubAck,
            MqttPacket::PubRec(_) => PacketType::PubRec,
            MqttPacket::PubRel(_) => PacketType::PubRel,
            MqttPacket::PubComp(_) => PacketType::PubComp,
            MqttPacket::PingResp(_) => PacketType::PingResp,
        }
    }

    /// Routes the packet to the matching receiver method.
    pub fn dispatch<R: PacketReceiver<N> + ?Sized>(self, receiver: &mut R) {
        match self {
            MqttPacket::Publish(p) => receiver.receive_publish(p),
            MqttPacket::PubAck(p) => receiver.receive_puback(p),
            MqttPacket::PubRec(p) => receiver.receive_pubrec(p),
            MqttPacket::PubRel(p) => receiver.receive_pubrel(p),
            MqttPacket::PubComp(p) => receiver.receive_pubcomp(p),
            MqttPacket::PingResp(p) => receiver.receive_pingresp(p),
        }
    }
}

//! # MQTT Session
//!
//! [`Session`] bundles everything one connection needs on the client side: the
//! packet sender, the identifier allocator, the outbound publication engine and
//! an [`InboundHandler`] for application traffic.
//!
//! The owning connection task drives it:
//!
//! ```ignore
//! let mut session = Session::<_, _, _, 4, 256>::new(TxBuffer::<512>::new(), SystemClock, handler);
//! session.publish("sensors/temp", b"21.5", QoS::AtLeastOnce, false);
//!
//! loop {
//!     let packet = read_packet::<_, 256>(&mut transport).await?;
//!     if let Err(e) = session.handle(packet) {
//!         if e.is_connection_fault() {
//!             return Err(e.into());
//!         }
//!     }
//!     session.poll();
//!     session.sender_mut().flush(&mut transport).await?;
//!
//!     if session.sender_mut().take_reconnect_request() {
//!         session.on_disconnect();
//!         session.sender_mut().clear();
//!         // ... rebuild the transport ...
//!         session.on_reconnected();
//!     }
//! }
//! ```

use crate::codec::Packet;
use crate::error::ProtocolError;
use crate::packet::{
    MqttPacket, PacketReceiver, PingReq, PingResp, PubAck, PubComp, PubRec, PubRel, Publish,
    QoS,
};
use crate::packet_id::PacketIdAllocator;
use crate::publication::{Publication, PublicationOptions};
use crate::timer::Clock;
use crate::transport::PacketSender;
use heapless::Vec;

/// Receives application-level inbound traffic.
pub trait InboundHandler<const N: usize> {
    /// Called once per inbound PUBLISH, after its acknowledgment was queued.
    ///
    /// A QoS 2 message redelivered before its PUBREL arrived is not passed on
    /// again.
    fn on_publish(&mut self, publish: &Publish<N>);

    fn on_ping_response(&mut self) {}
}

/// Client side of one MQTT connection.
///
/// Up to `MAX_INFLIGHT` inbound QoS 2 identifiers are remembered between PUBREC
/// and PUBREL for duplicate suppression.
pub struct Session<S, C, H, const MAX_INFLIGHT: usize, const N: usize>
where
    S: PacketSender,
    C: Clock,
    H: InboundHandler<N>,
{
    sender: S,
    ids: PacketIdAllocator,
    publication: Publication<C, MAX_INFLIGHT, N>,
    handler: H,
    awaiting_release: Vec<u16, MAX_INFLIGHT>,
}

impl<S, C, H, const MAX_INFLIGHT: usize, const N: usize> Session<S, C, H, MAX_INFLIGHT, N>
where
    S: PacketSender,
    C: Clock,
    H: InboundHandler<N>,
{
    pub fn new(sender: S, clock: C, handler: H) -> Self {
        Self::with_options(sender, clock, handler, PublicationOptions::default())
    }

    pub fn with_options(sender: S, clock: C, handler: H, options: PublicationOptions) -> Self {
        Self {
            sender,
            ids: PacketIdAllocator::new(),
            publication: Publication::new(clock, options),
            handler,
            awaiting_release: Vec::new(),
        }
    }

    /// Queues an outbound publish; see [`Publication::publish`].
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> bool {
        self.publication
            .publish(&mut self.ids, topic, payload, qos, retain)
    }

    /// Advances outbound delivery by one step.
    pub fn poll(&mut self) {
        self.publication.drive(&mut self.sender);
    }

    /// Decodes an assembled inbound packet and routes it.
    ///
    /// CONNACK, SUBACK and UNSUBACK are not routed here; they come back as
    /// [`ProtocolError::UnexpectedPacketType`], which is not a connection fault.
    /// Every other error is.
    pub fn handle(&mut self, packet: Packet<N>) -> Result<(), ProtocolError> {
        let packet = MqttPacket::decode(packet).inspect_err(|e| {
            if e.is_connection_fault() {
                error!("dropping inbound packet: {}", e);
            } else {
                debug!("not routing inbound packet: {}", e);
            }
        })?;
        trace!("handling {}", packet.packet_type().as_str());
        packet.dispatch(self);
        Ok(())
    }

    /// Queues a PINGREQ. Returns `false` if the sender had no room.
    pub fn ping(&mut self) -> bool {
        self.sender.send(&PingReq::new())
    }

    /// Call as soon as the connection is known to be down.
    pub fn on_disconnect(&mut self) {
        info!("connection lost");
        self.publication.on_disconnect();
    }

    /// Call once the connection is back up, before the next [`Session::poll`].
    pub fn on_reconnected(&mut self) {
        info!("connection restored");
        self.publication.resend_after_reconnect(&mut self.sender);
    }

    /// Starts over with a clean session: the identifier sequence restarts at 1.
    ///
    /// Only valid while nothing is in flight.
    pub fn reset_packet_ids(&mut self) -> bool {
        if !self.publication.is_empty() {
            return false;
        }
        self.ids.reset();
        true
    }

    pub fn publication(&self) -> &Publication<C, MAX_INFLIGHT, N> {
        &self.publication
    }

    pub fn packet_ids(&self) -> &PacketIdAllocator {
        &self.ids
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn sender_mut(&mut self) -> &mut S {
        &mut self.sender
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Inbound QoS 2 identifiers answered with PUBREC but not yet released.
    pub fn awaiting_release(&self) -> &[u16] {
        &self.awaiting_release
    }

    /// Dismantles the session, dropping any queued publishes.
    pub fn into_parts(self) -> (S, H) {
        (self.sender, self.handler)
    }

    fn reply(&mut self, ack: &impl crate::packet::ControlPacket, packet_id: u16) {
        if !self.sender.send(ack) {
            // The broker redelivers after its own timeout.
            warn!("could not enqueue {} {}", ack.packet_type().as_str(), packet_id);
        }
    }
}

impl<S, C, H, const MAX_INFLIGHT: usize, const N: usize> PacketReceiver<N>
    for Session<S, C, H, MAX_INFLIGHT, N>
where
    S: PacketSender,
    C: Clock,
    H: InboundHandler<N>,
{
    fn receive_publish(&mut self, publish: Publish<N>) {
        match (publish.qos(), publish.packet_id()) {
            (QoS::AtLeastOnce, Some(id)) => self.reply(&PubAck::new(id), id),
            (QoS::ExactlyOnce, Some(id)) => {
                self.reply(&PubRec::new(id), id);
                if self.awaiting_release.contains(&id) {
                    debug!("duplicate QoS 2 publish {} suppressed", id);
                    return;
                }
                if self.awaiting_release.push(id).is_err() {
                    warn!("too many unreleased QoS 2 publishes, {} untracked", id);
                }
            }
            _ => {}
        }
        self.handler.on_publish(&publish);
    }

    fn receive_puback(&mut self, ack: PubAck) {
        self.publication.receive_puback(&ack);
    }

    fn receive_pubrec(&mut self, rec: PubRec) {
        self.publication.receive_pubrec(&rec, &mut self.sender);
    }

    fn receive_pubrel(&mut self, rel: PubRel) {
        let id = rel.packet_id();
        self.awaiting_release.retain(|pending| *pending != id);
        self.reply(&PubComp::new(id), id);
    }

    fn receive_pubcomp(&mut self, comp: PubComp) {
        self.publication.receive_pubcomp(&comp);
    }

    fn receive_pingresp(&mut self, _resp: PingResp) {
        self.handler.on_ping_response();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketType;
    use crate::packet::ControlPacket;
    use crate::timer::SystemClock;

    #[derive(Default)]
    struct Wire {
        sent: Vec<Vec<u8, 32>, 8>,
    }

    impl PacketSender for Wire {
        fn send(&mut self, packet: &impl ControlPacket) -> bool {
            let bytes = Vec::from_slice(packet.as_bytes()).unwrap();
            self.sent.push(bytes).is_ok()
        }

        fn reconnect(&mut self) {}
    }

    #[derive(Default)]
    struct Inbox {
        topics: Vec<heapless::String<16>, 4>,
        pings: usize,
    }

    impl InboundHandler<32> for Inbox {
        fn on_publish(&mut self, publish: &Publish<32>) {
            self.topics.push(publish.topic().try_into().unwrap()).unwrap();
        }

        fn on_ping_response(&mut self) {
            self.pings += 1;
        }
    }

    type TestSession = Session<Wire, SystemClock, Inbox, 2, 32>;

    fn session() -> TestSession {
        Session::new(Wire::default(), SystemClock, Inbox::default())
    }

    fn inbound(bytes: &[u8]) -> Packet<32> {
        let mut packet = Packet::new();
        packet.feed(bytes);
        packet
    }

    #[test]
    fn inbound_qos1_publish_is_acked() {
        let mut session = session();
        session
            .handle(inbound(&[0x32, 0x06, 0x00, 0x01, b'a', 0x00, 0x05, b'!']))
            .unwrap();

        assert_eq!(session.sender().sent[0].as_slice(), &[0x40, 0x02, 0x00, 0x05]);
        assert_eq!(session.handler().topics[0].as_str(), "a");
    }

    #[test]
    fn inbound_qos2_flow() {
        let mut session = session();
        session
            .handle(inbound(&[0x34, 0x05, 0x00, 0x01, b'b', 0x00, 0x09]))
            .unwrap();
        session.handle(inbound(&[0x62, 0x02, 0x00, 0x09])).unwrap();

        let sent = &session.sender().sent;
        assert_eq!(sent[0].as_slice(), &[0x50, 0x02, 0x00, 0x09]);
        assert_eq!(sent[1].as_slice(), &[0x70, 0x02, 0x00, 0x09]);
    }

    #[test]
    fn inbound_qos0_publish_is_not_acked() {
        let mut session = session();
        session
            .handle(inbound(&[0x30, 0x04, 0x00, 0x01, b'c', b'x']))
            .unwrap();
        assert!(session.sender().sent.is_empty());
        assert_eq!(session.handler().topics.len(), 1);
    }

    #[test]
    fn unhandled_packet_type_is_an_error() {
        let mut session = session();
        let result = session.handle(inbound(&[0x90, 0x03, 0x00, 0x01, 0x00]));
        assert_eq!(
            result,
            Err(ProtocolError::UnexpectedPacketType(PacketType::SubAck as u8))
        );
        assert!(!result.unwrap_err().is_connection_fault());

        let result = session.handle(inbound(&[0x10, 0x00]));
        assert_eq!(
            result,
            Err(ProtocolError::InvalidPacketType(PacketType::Connect as u8))
        );
        assert!(result.unwrap_err().is_connection_fault());
    }

    #[test]
    fn redelivered_qos2_publish_reaches_handler_once() {
        let mut session = session();
        let first = [0x34, 0x05, 0x00, 0x01, b'd', 0x00, 0x07];
        let redelivered = [0x3C, 0x05, 0x00, 0x01, b'd', 0x00, 0x07];

        session.handle(inbound(&first)).unwrap();
        session.handle(inbound(&redelivered)).unwrap();
        assert_eq!(session.handler().topics.len(), 1);
        assert_eq!(session.awaiting_release(), &[7]);

        // Both copies are answered with PUBREC.
        let pubrec = [0x50, 0x02, 0x00, 0x07];
        assert_eq!(session.sender().sent[0].as_slice(), &pubrec);
        assert_eq!(session.sender().sent[1].as_slice(), &pubrec);

        session.handle(inbound(&[0x62, 0x02, 0x00, 0x07])).unwrap();
        assert!(session.awaiting_release().is_empty());

        // Once released, the identifier may carry a new message.
        session.handle(inbound(&first)).unwrap();
        assert_eq!(session.handler().topics.len(), 2);
    }

    #[test]
    fn ping_round_trip() {
        let mut session = session();
        assert!(session.ping());
        assert_eq!(session.sender().sent[0].as_slice(), &[0xC0, 0x00]);

        session.handle(inbound(&[0xD0, 0x00])).unwrap();
        assert_eq!(session.handler().pings, 1);
    }

    #[test]
    fn packet_ids_reset_only_when_idle() {
        let mut session = session();
        assert!(session.publish("t", b"x", QoS::AtLeastOnce, false));
        assert!(!session.reset_packet_ids());

        session.poll();
        session.handle(inbound(&[0x40, 0x02, 0x00, 0x01])).unwrap();
        assert!(session.publication().is_empty());
        assert!(session.reset_packet_ids());
        assert_eq!(session.packet_ids().peek(), 1);
    }
}

//! # Outbound Publication Engine
//!
//! Queues outbound publishes and walks each one through its QoS handshake. Only
//! the head of the queue is ever active; the rest wait untouched until they
//! reach the head, so publishes complete strictly in the order they were queued.
//!
//! Per-record progress:
//!
//! ```text
//! QoS 0: None --send--> (removed)
//! QoS 1: None --send--> PubAck --PUBACK--> (removed)
//! QoS 2: None --send--> PubRec --PUBREC/send PUBREL--> PubComp --PUBCOMP--> (removed)
//! ```
//!
//! A wait that outlives the ack timeout forces a reconnect. The record keeps its
//! packet and identifier; [`Publication::resend_after_reconnect`] then puts it back
//! into a sendable state.

use embassy_time::Duration;
use heapless::Deque;

use crate::inflight::{ExpectedReply, InFlight};
use crate::packet::{PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use crate::packet_id::PacketIdAllocator;
use crate::timer::Clock;
use crate::transport::PacketSender;

/// How long a sent packet may wait for its reply before a reconnect is forced.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Runtime settings for [`Publication`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicationOptions {
    pub ack_timeout: Duration,
}

impl Default for PublicationOptions {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

impl PublicationOptions {
    pub const fn new() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub const fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

/// Outbound publish queue of at most `MAX_INFLIGHT` records, each holding a
/// packet of up to `N` bytes.
///
/// All methods must be called from the single task that owns the connection.
pub struct Publication<C: Clock, const MAX_INFLIGHT: usize, const N: usize> {
    in_progress: Deque<InFlight<N>, MAX_INFLIGHT>,
    clock: C,
    options: PublicationOptions,
}

impl<C: Clock, const MAX_INFLIGHT: usize, const N: usize> Publication<C, MAX_INFLIGHT, N> {
    pub fn new(clock: C, options: PublicationOptions) -> Self {
        Self {
            in_progress: Deque::new(),
            clock,
            options,
        }
    }

    /// Queues a publish. Returns `false`, changing nothing, when the queue is full
    /// or the message does not fit a packet of `N` bytes.
    pub fn publish(
        &mut self,
        ids: &mut PacketIdAllocator,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> bool {
        if self.in_progress.is_full() {
            debug!("publish to {} rejected: {} messages in flight", topic, MAX_INFLIGHT);
            return false;
        }

        let packet = match Publish::build(ids, topic, payload, qos, retain) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("publish to {} rejected: {}", topic, e);
                return false;
            }
        };

        trace!("queued publish to {} with QoS {}", topic, qos as u8);
        self.in_progress.push_back(InFlight::new(packet)).is_ok()
    }

    /// Advances the head record: sends it if unsent, or checks its reply timeout.
    ///
    /// Call periodically from the connection task.
    pub fn drive<S: PacketSender>(&mut self, sender: &mut S) {
        let now = self.clock.now();
        let ack_timeout = self.options.ack_timeout;
        let Some(flight) = self.in_progress.front_mut() else {
            return;
        };

        let qos = flight.packet().qos();
        match (qos, flight.expected_reply()) {
            (QoS::AtMostOnce, _) => {
                flight.packet_mut().packet_mut().inc_send_retry_count();
                if sender.send(flight.packet()) {
                    trace!("QoS 0 publish completed");
                    self.in_progress.pop_front();
                } else {
                    trace!("could not enqueue QoS 0 publish");
                }
            }
            (_, ExpectedReply::None) => {
                flight.packet_mut().packet_mut().inc_send_retry_count();
                if sender.send(flight.packet()) {
                    let reply = if qos == QoS::AtLeastOnce {
                        ExpectedReply::PubAck
                    } else {
                        ExpectedReply::PubRec
                    };
                    flight.start_timer(now);
                    flight.set_expected_reply(reply);
                } else {
                    trace!("could not enqueue QoS {} publish", qos as u8);
                }
            }
            (_, waiting_for) => {
                let elapsed = flight.elapsed(now);
                if elapsed > ack_timeout {
                    error!(
                        "no reply to publish {} after {} ms, forcing reconnect",
                        flight.packet_id().unwrap_or(0),
                        elapsed.as_millis()
                    );
                    flight.stop_timer(now);
                    sender.reconnect();
                } else {
                    trace!(
                        "publish {} waiting for {:?}, {} ms elapsed",
                        flight.packet_id().unwrap_or(0),
                        waiting_for,
                        elapsed.as_millis()
                    );
                }
            }
        }
    }

    /// Completes a QoS 1 head record whose identifier matches.
    pub fn receive_puback(&mut self, pub_ack: &PubAck) {
        self.complete_head(ExpectedReply::PubAck, pub_ack.packet_id());
    }

    /// A matching PUBREC moves the head record to phase 2 by sending PUBREL.
    ///
    /// If the PUBREL cannot be sent the record stays in `PubRec`; the timeout
    /// and redelivery path recovers it.
    pub fn receive_pubrec<S: PacketSender>(&mut self, pub_rec: &PubRec, sender: &mut S) {
        let now = self.clock.now();
        let Some(flight) = self.in_progress.front_mut() else {
            return;
        };
        if !flight.awaits(ExpectedReply::PubRec, pub_rec.packet_id()) {
            debug!("ignoring PUBREC {}", pub_rec.packet_id());
            return;
        }

        flight.start_timer(now);
        let pub_rel = PubRel::new(pub_rec.packet_id());
        if sender.send(&pub_rel) {
            flight.set_expected_reply(ExpectedReply::PubComp);
        } else {
            debug!("could not enqueue PUBREL {}", pub_rec.packet_id());
        }
    }

    /// Completes a QoS 2 head record whose identifier matches.
    pub fn receive_pubcomp(&mut self, pub_comp: &PubComp) {
        self.complete_head(ExpectedReply::PubComp, pub_comp.packet_id());
    }

    fn complete_head(&mut self, reply: ExpectedReply, packet_id: u16) {
        match self.in_progress.front() {
            Some(flight) if flight.awaits(reply, packet_id) => {
                trace!("QoS {} publish {} completed", flight.packet().qos() as u8, packet_id);
                self.in_progress.pop_front();
            }
            _ => debug!("ignoring {:?} {}", reply, packet_id),
        }
    }

    /// Zeroes the head record's timer so the reconnect that follows a dropped
    /// connection does not immediately count as a reply timeout.
    pub fn on_disconnect(&mut self) {
        let now = self.clock.now();
        if let Some(flight) = self.in_progress.front_mut() {
            flight.zero_timer(now);
        }
    }

    /// Restores the head record after a reconnect. Must run before the next
    /// [`Publication::drive`].
    ///
    /// Unacknowledged PUBLISH and PUBREL packets are redelivered with their
    /// original identifiers (MQTT-4.4.0-1).
    pub fn resend_after_reconnect<S: PacketSender>(&mut self, sender: &mut S) {
        let now = self.clock.now();
        let Some(flight) = self.in_progress.front_mut() else {
            return;
        };

        match flight.expected_reply() {
            ExpectedReply::PubAck => {
                info!("redelivering publish {}", flight.packet_id().unwrap_or(0));
                flight.packet_mut().set_dup_flag();
                flight.zero_timer(now);
                flight.set_expected_reply(ExpectedReply::None);
            }
            ExpectedReply::PubRec => {
                // TODO: decide whether this redelivery should carry the dup flag
                // like the PubAck branch does.
                info!("redelivering publish {}", flight.packet_id().unwrap_or(0));
                flight.zero_timer(now);
                flight.set_expected_reply(ExpectedReply::None);
            }
            ExpectedReply::PubComp => {
                let packet_id = flight.packet_id().unwrap_or(0);
                info!("redelivering PUBREL {}", packet_id);
                // Restarted so an unanswered or unsent PUBREL times out again.
                flight.start_timer(now);
                if !sender.send(&PubRel::new(packet_id)) {
                    warn!("could not enqueue PUBREL {} after reconnect", packet_id);
                }
            }
            ExpectedReply::None => {
                flight.packet_mut().set_dup_flag();
                flight.start_timer(now);
                flight.set_expected_reply(ExpectedReply::None);
            }
        }
    }

    pub fn head(&self) -> Option<&InFlight<N>> {
        self.in_progress.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InFlight<N>> {
        self.in_progress.iter()
    }

    pub fn len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_progress.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.in_progress.is_full()
    }

    pub fn capacity(&self) -> usize {
        MAX_INFLIGHT
    }

    /// The settings this engine was created with.
    pub fn options(&self) -> &PublicationOptions {
        &self.options
    }

    /// The time source timers are sampled against.
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketType;
    use crate::packet::ControlPacket;
    use core::cell::Cell;
    use embassy_time::Instant;

    struct ManualClock(Cell<u64>);

    impl ManualClock {
        fn new() -> Self {
            Self(Cell::new(1_000))
        }

        fn advance_secs(&self, secs: u64) {
            self.0.set(self.0.get() + secs * 1_000);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            Instant::from_millis(self.0.get())
        }
    }

    #[derive(Default)]
    struct MockSender {
        accept: bool,
        sent: heapless::Vec<(PacketType, heapless::Vec<u8, 64>), 16>,
        reconnects: usize,
    }

    impl MockSender {
        fn accepting() -> Self {
            Self {
                accept: true,
                ..Self::default()
            }
        }

        fn last(&self) -> (PacketType, &[u8]) {
            let (kind, bytes) = self.sent.last().unwrap();
            (*kind, bytes.as_slice())
        }
    }

    impl PacketSender for MockSender {
        fn send(&mut self, packet: &impl ControlPacket) -> bool {
            if self.accept {
                let bytes = heapless::Vec::from_slice(packet.as_bytes()).unwrap();
                self.sent.push((packet.packet_type(), bytes)).unwrap();
            }
            self.accept
        }

        fn reconnect(&mut self) {
            self.reconnects += 1;
        }
    }

    type TestPublication<'c> = Publication<&'c ManualClock, 3, 64>;

    fn setup(clock: &ManualClock) -> (TestPublication<'_>, PacketIdAllocator) {
        (
            Publication::new(clock, PublicationOptions::default()),
            PacketIdAllocator::new(),
        )
    }

    fn active_markers(publication: &TestPublication<'_>) -> usize {
        publication
            .iter()
            .filter(|f| f.expected_reply() != ExpectedReply::None)
            .count()
    }

    #[test]
    fn admission_bound() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        for _ in 0..3 {
            assert!(publication.publish(&mut ids, "t", b"x", QoS::AtMostOnce, false));
        }
        assert!(!publication.publish(&mut ids, "t", b"x", QoS::AtLeastOnce, false));
        assert_eq!(publication.len(), 3);
        // The rejected QoS 1 publish did not consume an identifier.
        assert_eq!(ids.peek(), 1);
    }

    #[test]
    fn oversize_publish_rejected() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        assert!(!publication.publish(&mut ids, "t", &[0u8; 100], QoS::AtMostOnce, false));
        assert!(publication.is_empty());
    }

    #[test]
    fn qos0_fire_and_forget() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::AtMostOnce, false);

        publication.drive(&mut sender);

        assert!(publication.is_empty());
        assert_eq!(sender.last().0, PacketType::Publish);
        assert_eq!(ids.peek(), 1);
    }

    #[test]
    fn qos0_rejected_send_retries() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::default();
        publication.publish(&mut ids, "t", b"x", QoS::AtMostOnce, false);

        for _ in 0..5 {
            publication.drive(&mut sender);
        }
        assert_eq!(publication.len(), 1);
        assert_eq!(publication.head().unwrap().packet().packet().send_retry_count(), 5);

        sender.accept = true;
        publication.drive(&mut sender);
        assert!(publication.is_empty());
    }

    #[test]
    fn qos1_handshake() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::AtLeastOnce, false);

        publication.drive(&mut sender);
        let head = publication.head().unwrap();
        assert_eq!(head.expected_reply(), ExpectedReply::PubAck);
        assert!(head.timer().is_running());

        publication.receive_puback(&PubAck::new(2));
        assert_eq!(publication.len(), 1);

        publication.receive_puback(&PubAck::new(1));
        assert!(publication.is_empty());
    }

    #[test]
    fn qos1_rejected_send_stays_unsent() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::default();
        publication.publish(&mut ids, "t", b"x", QoS::AtLeastOnce, false);

        publication.drive(&mut sender);
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::None);
    }

    #[test]
    fn puback_before_send_is_ignored() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        publication.publish(&mut ids, "t", b"x", QoS::AtLeastOnce, false);

        publication.receive_puback(&PubAck::new(1));
        assert_eq!(publication.len(), 1);
    }

    #[test]
    fn qos2_handshake() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::ExactlyOnce, false);
        publication.publish(&mut ids, "t", b"y", QoS::ExactlyOnce, false);

        publication.drive(&mut sender);
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubRec);
        assert_eq!(active_markers(&publication), 1);

        // Wrong kind and wrong identifier are both ignored.
        publication.receive_pubcomp(&PubComp::new(1));
        publication.receive_pubrec(&PubRec::new(2), &mut sender);
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubRec);

        publication.receive_pubrec(&PubRec::new(1), &mut sender);
        assert_eq!(sender.last(), (PacketType::PubRel, &[0x62, 0x02, 0x00, 0x01][..]));
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubComp);
        assert_eq!(active_markers(&publication), 1);

        // Driving while awaiting a reply sends nothing more.
        let sent_before = sender.sent.len();
        publication.drive(&mut sender);
        assert_eq!(sender.sent.len(), sent_before);

        publication.receive_pubcomp(&PubComp::new(1));
        assert_eq!(publication.len(), 1);
        assert_eq!(publication.head().unwrap().packet_id(), Some(2));
        assert_eq!(active_markers(&publication), 0);
    }

    #[test]
    fn pubrel_send_failure_stays_in_phase_one() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::ExactlyOnce, false);
        publication.drive(&mut sender);

        sender.accept = false;
        publication.receive_pubrec(&PubRec::new(1), &mut sender);
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubRec);

        clock.advance_secs(16);
        publication.drive(&mut sender);
        assert_eq!(sender.reconnects, 1);

        publication.on_disconnect();
        sender.accept = true;
        sender.sent.clear();
        publication.resend_after_reconnect(&mut sender);
        publication.drive(&mut sender);

        // The publish goes out again with its identifier and no dup flag.
        assert_eq!(sender.sent.len(), 1);
        assert_eq!(
            sender.last(),
            (PacketType::Publish, &[0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x01, b'x'][..])
        );
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubRec);
        assert_eq!(publication.head().unwrap().packet_id(), Some(1));
    }

    #[test]
    fn pubcomp_wait_times_out_again_after_redelivery() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::ExactlyOnce, false);
        publication.drive(&mut sender);
        publication.receive_pubrec(&PubRec::new(1), &mut sender);

        clock.advance_secs(16);
        publication.drive(&mut sender);
        assert_eq!(sender.reconnects, 1);

        publication.on_disconnect();
        sender.accept = false;
        publication.resend_after_reconnect(&mut sender);
        assert!(publication.head().unwrap().timer().is_running());

        clock.advance_secs(15);
        publication.drive(&mut sender);
        assert_eq!(sender.reconnects, 1);

        clock.advance_secs(1);
        publication.drive(&mut sender);
        assert_eq!(sender.reconnects, 2);
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubComp);
    }

    #[test]
    fn timeout_forces_single_reconnect() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"payload", QoS::AtLeastOnce, false);
        publication.drive(&mut sender);
        let before: heapless::Vec<u8, 64> =
            heapless::Vec::from_slice(publication.head().unwrap().packet().as_bytes()).unwrap();

        clock.advance_secs(15);
        publication.drive(&mut sender);
        assert_eq!(sender.reconnects, 0);

        clock.advance_secs(1);
        publication.drive(&mut sender);
        assert_eq!(sender.reconnects, 1);

        let head = publication.head().unwrap();
        assert!(!head.timer().is_running());
        assert_eq!(head.expected_reply(), ExpectedReply::PubAck);
        assert_eq!(head.packet_id(), Some(1));
        assert_eq!(head.packet().payload(), b"payload");
        assert_eq!(head.packet().as_bytes(), before.as_slice());
    }

    #[test]
    fn custom_ack_timeout() {
        let clock = ManualClock::new();
        let mut publication: TestPublication<'_> = Publication::new(
            &clock,
            PublicationOptions::new().with_ack_timeout(Duration::from_secs(2)),
        );
        let mut ids = PacketIdAllocator::new();
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::AtLeastOnce, false);
        publication.drive(&mut sender);

        clock.advance_secs(3);
        publication.drive(&mut sender);
        assert_eq!(sender.reconnects, 1);
    }

    #[test]
    fn disconnect_zeroes_head_timer() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::AtLeastOnce, false);
        publication.drive(&mut sender);

        clock.advance_secs(14);
        publication.on_disconnect();
        clock.advance_secs(14);
        publication.drive(&mut sender);

        assert_eq!(sender.reconnects, 0);
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubAck);
    }

    #[test]
    fn resend_while_awaiting_puback() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::AtLeastOnce, false);
        publication.drive(&mut sender);

        publication.resend_after_reconnect(&mut sender);
        let head = publication.head().unwrap();
        assert!(head.packet().dup());
        assert_eq!(head.expected_reply(), ExpectedReply::None);
        assert_eq!(head.packet_id(), Some(1));

        publication.drive(&mut sender);
        assert_eq!(sender.last().1[0], 0x3A);
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubAck);
    }

    #[test]
    fn resend_while_awaiting_pubrec_leaves_dup_clear() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::ExactlyOnce, false);
        publication.drive(&mut sender);

        publication.resend_after_reconnect(&mut sender);
        let head = publication.head().unwrap();
        assert!(!head.packet().dup());
        assert_eq!(head.expected_reply(), ExpectedReply::None);
        assert_eq!(head.packet_id(), Some(1));
    }

    #[test]
    fn resend_while_awaiting_pubcomp_sends_pubrel() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "t", b"x", QoS::ExactlyOnce, false);
        publication.drive(&mut sender);
        publication.receive_pubrec(&PubRec::new(1), &mut sender);
        sender.sent.clear();

        publication.resend_after_reconnect(&mut sender);

        assert_eq!(sender.sent.len(), 1);
        assert_eq!(sender.last(), (PacketType::PubRel, &[0x62, 0x02, 0x00, 0x01][..]));
        assert_eq!(publication.head().unwrap().expected_reply(), ExpectedReply::PubComp);
    }

    #[test]
    fn resend_before_first_send_marks_dup() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::default();
        publication.publish(&mut ids, "t", b"x", QoS::AtLeastOnce, false);
        publication.drive(&mut sender);

        publication.resend_after_reconnect(&mut sender);
        let head = publication.head().unwrap();
        assert!(head.packet().dup());
        assert!(head.timer().is_running());
        assert_eq!(head.expected_reply(), ExpectedReply::None);
    }

    #[test]
    fn pending_records_untouched_until_head() {
        let clock = ManualClock::new();
        let (mut publication, mut ids) = setup(&clock);
        let mut sender = MockSender::accepting();
        publication.publish(&mut ids, "a", b"1", QoS::AtLeastOnce, false);
        publication.publish(&mut ids, "b", b"2", QoS::AtLeastOnce, false);
        publication.drive(&mut sender);

        clock.advance_secs(16);
        publication.drive(&mut sender);
        publication.on_disconnect();
        publication.resend_after_reconnect(&mut sender);

        let second = publication.iter().nth(1).unwrap();
        assert_eq!(second.expected_reply(), ExpectedReply::None);
        assert!(!second.packet().dup());
        assert!(!second.timer().is_running());

        // Acks for the second record are ignored while the first is at the head.
        publication.drive(&mut sender);
        publication.receive_puback(&PubAck::new(2));
        assert_eq!(publication.len(), 2);
        publication.receive_puback(&PubAck::new(1));
        assert_eq!(publication.head().unwrap().packet().topic(), "b");
    }
}

//! The in-flight record: one outbound publish plus its handshake progress.

use embassy_time::{Duration, Instant};

use crate::packet::Publish;
use crate::timer::ElapsedTimer;

/// The reply an in-flight publish is waiting for.
///
/// `None` means the packet has not been (successfully) sent yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ExpectedReply {
    #[default]
    None,
    /// A QoS 1 PUBLISH has been sent.
    PubAck,
    /// A QoS 2 PUBLISH has been sent.
    PubRec,
    /// PUBREC was received and answered with PUBREL.
    PubComp,
}

/// A queued or in-progress outbound publish.
#[derive(Debug, Clone)]
pub struct InFlight<const N: usize> {
    packet: Publish<N>,
    timer: ElapsedTimer,
    waiting_for: ExpectedReply,
}

impl<const N: usize> InFlight<N> {
    pub fn new(packet: Publish<N>) -> Self {
        Self {
            packet,
            timer: ElapsedTimer::new(),
            waiting_for: ExpectedReply::None,
        }
    }

    pub fn packet(&self) -> &Publish<N> {
        &self.packet
    }

    pub(crate) fn packet_mut(&mut self) -> &mut Publish<N> {
        &mut self.packet
    }

    /// Identifier of the publish; `None` for QoS 0.
    pub fn packet_id(&self) -> Option<u16> {
        self.packet.packet_id()
    }

    pub fn expected_reply(&self) -> ExpectedReply {
        self.waiting_for
    }

    pub(crate) fn set_expected_reply(&mut self, reply: ExpectedReply) {
        self.waiting_for = reply;
    }

    /// Whether `reply` with identifier `packet_id` is the one this record awaits.
    pub fn awaits(&self, reply: ExpectedReply, packet_id: u16) -> bool {
        reply != ExpectedReply::None
            && self.waiting_for == reply
            && self.packet_id() == Some(packet_id)
    }

    pub(crate) fn start_timer(&mut self, now: Instant) {
        self.timer.start(now);
    }

    pub(crate) fn stop_timer(&mut self, now: Instant) {
        self.timer.stop(now);
    }

    pub(crate) fn zero_timer(&mut self, now: Instant) {
        self.timer.zero(now);
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.timer.elapsed(now)
    }

    pub fn timer(&self) -> &ElapsedTimer {
        &self.timer
    }
}

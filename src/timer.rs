//! Monotonic time sources and the elapsed-time timer used by in-flight records.
//!
//! Timers never run in the background. They are sampled against a [`Clock`]
//! whenever the publication engine is driven, so expiry is detected at the next
//! drive call after the deadline.

use embassy_time::{Duration, Instant};

/// A monotonic time source.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The embassy-time driver clock.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Measures the time since it was started (or last zeroed).
///
/// A stopped timer keeps reporting the elapsed time at which it was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedTimer {
    start: Instant,
    end: Instant,
    running: bool,
}

impl Default for ElapsedTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ElapsedTimer {
    pub const fn new() -> Self {
        Self {
            start: Instant::from_ticks(0),
            end: Instant::from_ticks(0),
            running: false,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.start = now;
        self.running = true;
    }

    pub fn stop(&mut self, now: Instant) {
        self.end = now;
        self.running = false;
    }

    /// Resets the elapsed time to zero without starting or stopping the timer.
    pub fn zero(&mut self, now: Instant) {
        self.start = now;
        self.end = now;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        let until = if self.running { now } else { self.end };
        until.saturating_duration_since(self.start)
    }
}

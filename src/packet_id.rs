//! Packet identifier allocation.
//!
//! QoS 1/2 publishes carry a 16-bit identifier that correlates them with their
//! acknowledgments. One allocator lives in each session and is passed by `&mut`
//! into every packet constructor that needs an identifier.

/// Issues identifiers 1, 2, ..., 65535, 1, ... (zero is never returned).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketIdAllocator {
    next: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// Returns the next identifier and advances the counter, wrapping past zero.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// The identifier the next call to [`PacketIdAllocator::next_id`] returns.
    pub fn peek(&self) -> u16 {
        self.next
    }

    /// Starts over from 1, as on a clean session.
    pub fn reset(&mut self) {
        self.next = 1;
    }
}

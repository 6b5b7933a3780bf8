//! Stream slot identifiers

use core::fmt;

/// Identifies one destination of a stream on the sending actor.
///
/// Slots are 16-bit values. Zero is reserved as the "no slot" sentinel,
/// so a freshly defaulted path never collides with a live one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct StreamSlot(u16);

impl StreamSlot {
    /// Sentinel value indicating no slot
    pub const INVALID: StreamSlot = StreamSlot(0);

    #[inline]
    pub const fn new(id: u16) -> Self {
        StreamSlot(id)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u16> for StreamSlot {
    #[inline]
    fn from(id: u16) -> Self {
        StreamSlot(id)
    }
}

impl fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "StreamSlot({})", self.0)
        } else {
            write!(f, "StreamSlot(INVALID)")
        }
    }
}

impl fmt::Display for StreamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for StreamSlot {
    fn default() -> Self {
        StreamSlot::INVALID
    }
}

/// The pair of slots naming both ends of one path.
///
/// `sender` is the slot on the emitting actor and is what managers and the
/// router key on. `receiver` is the slot the target uses for the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamSlots {
    pub sender: StreamSlot,
    pub receiver: StreamSlot,
}

impl StreamSlots {
    #[inline]
    pub const fn new(sender: StreamSlot, receiver: StreamSlot) -> Self {
        Self { sender, receiver }
    }

    /// Swap sender and receiver, i.e. the view from the other end.
    #[inline]
    pub const fn invert(self) -> Self {
        Self {
            sender: self.receiver,
            receiver: self.sender,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_sentinel() {
        assert!(!StreamSlot::INVALID.is_valid());
        assert!(!StreamSlot::default().is_valid());
        assert!(StreamSlot::new(7).is_valid());
        assert_eq!(StreamSlot::from(7u16).as_u16(), 7);
    }

    #[test]
    fn test_slots_invert() {
        let s = StreamSlots::new(StreamSlot::new(1), StreamSlot::new(9));
        let inv = s.invert();
        assert_eq!(inv.sender, StreamSlot::new(9));
        assert_eq!(inv.receiver, StreamSlot::new(1));
        assert_eq!(inv.invert(), s);
    }
}

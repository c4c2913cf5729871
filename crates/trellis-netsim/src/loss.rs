//! Shared rotating loss mask.
//!
//! A 64-bit mask decides, per submission, whether the packet is lost: bit 0
//! is consumed and the mask rotates right, so a given seed yields a
//! repeating, fully deterministic loss pattern. Both directions of a link
//! pair (and both link pairs of a scenario) share one mask, which is what
//! makes scripted loss patterns like "lose packet 31" expressible.

use std::cell::RefCell;
use std::rc::Rc;

/// Deterministic rotating loss pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossMask {
    bits: u64,
}

impl LossMask {
    /// A mask of 0 never loses anything.
    pub fn new(bits: u64) -> Self {
        LossMask { bits }
    }

    /// Replace the pattern mid-scenario.
    pub fn set(&mut self, bits: u64) {
        self.bits = bits;
    }

    /// Consume one decision: returns true if the next packet is lost.
    pub fn next_lost(&mut self) -> bool {
        let lost = self.bits & 1 == 1;
        self.bits = self.bits.rotate_right(1);
        lost
    }
}

/// Handle shared between all links of a scenario. The simulation is
/// single-threaded, so `Rc<RefCell<_>>` is the whole synchronization story.
pub type SharedLossMask = Rc<RefCell<LossMask>>;

/// Convenience constructor for a shared mask.
pub fn shared(bits: u64) -> SharedLossMask {
    Rc::new(RefCell::new(LossMask::new(bits)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_mask_never_loses() {
        let mut mask = LossMask::new(0);
        for _ in 0..256 {
            assert!(!mask.next_lost());
        }
    }

    #[test]
    fn pattern_rotates() {
        // Bit 0 and bit 2 set: packets 0 and 2 of every 64 are lost.
        let mut mask = LossMask::new(0b101);
        let lost: Vec<bool> = (0..6).map(|_| mask.next_lost()).collect();
        assert_eq!(lost, vec![true, false, true, false, false, false]);
        // After a full rotation the pattern repeats.
        for _ in 6..64 {
            mask.next_lost();
        }
        assert!(mask.next_lost());
    }

    #[test]
    fn single_high_bit_hits_once_per_cycle() {
        let mut mask = LossMask::new(1u64 << 31);
        let hits = (0..64).filter(|_| mask.next_lost()).count();
        assert_eq!(hits, 1);
    }
}

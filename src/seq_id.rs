//! Sequence-id ranges for backend connections.
//!
//! Each backend connection rewrites request ids inside its own range so ids
//! from different connections to one backend never collide. Ranges are
//! handed out by a [`SeqIdAllocator`] shared by everything that opens
//! connections.

use std::sync::{Mutex, PoisonError};

/// Width of each allocated range.
pub const RANGE_WIDTH: i32 = 1_000_000;

/// Number of distinct ranges handed out before the allocator wraps.
pub const RANGE_SLOTS: i32 = 101;

/// Inclusive range of sequence ids a connection may use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqIdRange {
    /// Smallest id in the range.
    pub min: i32,
    /// Largest id in the range.
    pub max: i32,
}

impl SeqIdRange {
    /// Range used by connections registered by backends.
    pub const LB: Self = Self {
        min: 1,
        max: RANGE_WIDTH,
    };

    /// Range for allocation slot `slot`.
    #[must_use]
    pub fn for_slot(slot: i32) -> Self {
        let min = slot.rem_euclid(RANGE_SLOTS) * RANGE_WIDTH;
        Self {
            min,
            max: min + RANGE_WIDTH - 1,
        }
    }

    /// Whether `id` falls inside the range.
    #[must_use]
    pub fn contains(self, id: i32) -> bool { (self.min..=self.max).contains(&id) }
}

/// Hands out id ranges to new connections, cycling through the slots.
#[derive(Debug, Default)]
pub struct SeqIdAllocator {
    next_slot: Mutex<i32>,
}

impl SeqIdAllocator {
    /// Create an allocator starting at slot zero.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Range for the next connection.
    pub fn allocate(&self) -> SeqIdRange {
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = *next;
        *next = (slot + 1) % RANGE_SLOTS;
        SeqIdRange::for_slot(slot)
    }
}

/// Counter producing ids inside one range, owned by a write loop.
#[derive(Debug)]
pub struct SeqIds {
    range: SeqIdRange,
    current: i32,
}

impl SeqIds {
    /// Start counting at the bottom of `range`.
    #[must_use]
    pub fn new(range: SeqIdRange) -> Self {
        Self {
            range,
            current: range.min,
        }
    }

    /// The next id, wrapping to the minimum after the maximum.
    pub fn next_id(&mut self) -> i32 {
        let id = self.current;
        self.current = if id >= self.range.max {
            self.range.min
        } else {
            id + 1
        };
        id
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{RANGE_SLOTS, SeqIdAllocator, SeqIdRange, SeqIds};

    #[test]
    fn allocator_cycles_through_slots() {
        let allocator = SeqIdAllocator::new();
        let first = allocator.allocate();
        assert_eq!(first, SeqIdRange { min: 0, max: 999_999 });
        let second = allocator.allocate();
        assert_eq!(second.min, 1_000_000);
        for _ in 2..RANGE_SLOTS {
            allocator.allocate();
        }
        assert_eq!(allocator.allocate(), first);
    }

    #[test]
    fn ids_wrap_inside_range() {
        let mut ids = SeqIds::new(SeqIdRange { min: 5, max: 7 });
        let seen: Vec<_> = (0..5).map(|_| ids.next_id()).collect();
        assert_eq!(seen, vec![5, 6, 7, 5, 6]);
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(1_000_000, true)]
    #[case(1_000_001, false)]
    fn lb_range_bounds(#[case] id: i32, #[case] inside: bool) {
        assert_eq!(SeqIdRange::LB.contains(id), inside);
    }
}

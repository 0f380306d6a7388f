//! Per-cell ring of decoded subframes
//!
//! Slots are indexed by `tti mod size`. The header is the last TTI up to
//! which the ring is known to be complete; it only moves forward, over
//! filled slots or over gaps older than the gap timeout.

use common::{SubframeDciSet, Tti};
use tracing::{debug, trace};

/// Ring slots, 32 frames
pub const DEFAULT_RING_SIZE: usize = 320;

/// Subframes after which a missing TTI is given up on
pub const DEFAULT_GAP_TIMEOUT: u16 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored {
        /// Unconsumed entry replaced by this insert
        overwritten: Option<Tti>,
        /// Gaps skipped by the timeout during this insert
        forced_gaps: usize,
    },
    /// At or behind the header; discarded
    Late,
    /// Further behind the header than the ring spans, so not a straggler:
    /// the front-end's TTI went backwards. Discarded like `Late`; reported
    /// once until the next stored set.
    Rewound,
}

pub struct CellRingBuffer {
    slots: Vec<Option<SubframeDciSet>>,
    gap_timeout: u16,
    origin: Option<Tti>,
    header: Option<Tti>,
    most_recent: Option<Tti>,
    rewound: bool,
}

impl CellRingBuffer {
    pub fn new(size: usize, gap_timeout: u16) -> Self {
        let size = size.max(1);
        Self {
            slots: (0..size).map(|_| None).collect(),
            gap_timeout: gap_timeout.clamp(1, size.min(common::TTI_WRAP as usize / 2) as u16),
            origin: None,
            header: None,
            most_recent: None,
            rewound: false,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Last TTI known complete; `None` before the first insert
    pub fn header(&self) -> Option<Tti> {
        self.header
    }

    /// Header value set by the first insert
    pub fn origin(&self) -> Option<Tti> {
        self.origin
    }

    pub fn most_recent(&self) -> Option<Tti> {
        self.most_recent
    }

    pub fn insert(&mut self, set: SubframeDciSet) -> InsertOutcome {
        let tti = set.tti;
        let header = match self.header {
            Some(header) => header,
            None => {
                let header = tti.prev();
                debug!("Ring origin at TTI {}", header);
                self.origin = Some(header);
                self.header = Some(header);
                header
            }
        };

        if !tti.is_after(header) {
            trace!("TTI {} behind header {}", tti, header);
            let far_behind = tti.distance_to(header) as usize >= self.size();
            if far_behind && !self.rewound {
                self.rewound = true;
                return InsertOutcome::Rewound;
            }
            return InsertOutcome::Late;
        }
        self.rewound = false;

        let index = tti.ring_index(self.size());
        let overwritten = self.slots[index].as_ref().map(|old| old.tti).filter(|old| *old != tti);
        self.slots[index] = Some(set);

        if self.most_recent.map_or(true, |mr| tti.is_after(mr)) {
            self.most_recent = Some(tti);
        }

        InsertOutcome::Stored {
            overwritten,
            forced_gaps: self.advance(),
        }
    }

    fn advance(&mut self) -> usize {
        let (Some(mut header), Some(most_recent)) = (self.header, self.most_recent) else {
            return 0;
        };

        let mut forced = 0;
        loop {
            let next = header.next();
            let filled = self.slots[next.ring_index(self.size())]
                .as_ref()
                .is_some_and(|s| s.tti == next);
            if filled {
                header = next;
            } else if most_recent.is_after(next) && next.distance_to(most_recent) >= self.gap_timeout {
                debug!("TTI {} missing for {} subframes, skipped", next, next.distance_to(most_recent));
                forced += 1;
                header = next;
            } else {
                break;
            }
        }

        self.header = Some(header);
        forced
    }

    /// Stored entry for `tti`, if it is still in its slot
    pub fn peek(&self, tti: Tti) -> Option<&SubframeDciSet> {
        self.slots[tti.ring_index(self.size())].as_ref().filter(|s| s.tti == tti)
    }

    /// Remove and return the entry for `tti`
    pub fn take(&mut self, tti: Tti) -> Option<SubframeDciSet> {
        let index = tti.ring_index(self.size());
        if self.slots[index].as_ref().is_some_and(|s| s.tti == tti) {
            self.slots[index].take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::CellIndex;

    fn set(tti: u32) -> SubframeDciSet {
        SubframeDciSet::new(CellIndex(0), Tti::new(tti), 50, 0)
    }

    #[test]
    fn test_first_insert_sets_header_behind_it() {
        let mut ring = CellRingBuffer::new(DEFAULT_RING_SIZE, DEFAULT_GAP_TIMEOUT);
        assert_eq!(ring.header(), None);
        ring.insert(set(500));
        assert_eq!(ring.origin(), Some(Tti::new(499)));
        assert_eq!(ring.header(), Some(Tti::new(500)));
    }

    #[test]
    fn test_out_of_order_inserts_close_the_run() {
        let mut ring = CellRingBuffer::new(DEFAULT_RING_SIZE, DEFAULT_GAP_TIMEOUT);
        ring.insert(set(10));
        ring.insert(set(12));
        ring.insert(set(13));
        assert_eq!(ring.header(), Some(Tti::new(10)));

        ring.insert(set(11));
        assert_eq!(ring.header(), Some(Tti::new(13)));
        assert_eq!(ring.most_recent(), Some(Tti::new(13)));
    }

    #[test]
    fn test_missing_tti_released_after_timeout() {
        let mut ring = CellRingBuffer::new(DEFAULT_RING_SIZE, DEFAULT_GAP_TIMEOUT);
        for tti in 90..100 {
            ring.insert(set(tti));
        }
        assert_eq!(ring.header(), Some(Tti::new(99)));

        let mut forced_total = 0;
        for tti in 101..130 {
            if let InsertOutcome::Stored { forced_gaps, .. } = ring.insert(set(tti)) {
                forced_total += forced_gaps;
            }
            assert_eq!(ring.header(), Some(Tti::new(99)));
        }

        // 30th insert after the gap
        assert_eq!(ring.insert(set(130)), InsertOutcome::Stored { overwritten: None, forced_gaps: 1 });
        assert_eq!(forced_total, 0);
        assert_eq!(ring.header(), Some(Tti::new(130)));
        assert!(ring.peek(Tti::new(100)).is_none());
    }

    #[test]
    fn test_header_crosses_wraparound() {
        let mut ring = CellRingBuffer::new(DEFAULT_RING_SIZE, DEFAULT_GAP_TIMEOUT);
        for tti in [10237, 10238, 10239, 0, 1] {
            ring.insert(set(tti));
        }
        assert_eq!(ring.header(), Some(Tti::new(1)));
        assert_eq!(ring.insert(set(10239)), InsertOutcome::Late);
    }

    #[test]
    fn test_backward_jump_reported_once() {
        let mut ring = CellRingBuffer::new(DEFAULT_RING_SIZE, DEFAULT_GAP_TIMEOUT);
        for tti in 1000..1010 {
            ring.insert(set(tti));
        }
        // A straggler just behind the header is merely late
        assert_eq!(ring.insert(set(1005)), InsertOutcome::Late);

        assert_eq!(ring.insert(set(100)), InsertOutcome::Rewound);
        assert_eq!(ring.insert(set(101)), InsertOutcome::Late);
        assert_eq!(ring.header(), Some(Tti::new(1009)));

        assert!(matches!(ring.insert(set(1010)), InsertOutcome::Stored { .. }));
        assert_eq!(ring.insert(set(200)), InsertOutcome::Rewound);
    }

    #[test]
    fn test_stale_entry_overwritten() {
        let mut ring = CellRingBuffer::new(8, 4);
        ring.insert(set(0));
        let outcome = ring.insert(set(8));
        assert_eq!(outcome, InsertOutcome::Stored { overwritten: Some(Tti::new(0)), forced_gaps: 4 });
        assert!(ring.take(Tti::new(0)).is_none());
        assert_eq!(ring.take(Tti::new(8)).map(|s| s.tti), Some(Tti::new(8)));
        assert!(ring.take(Tti::new(8)).is_none());
    }
}

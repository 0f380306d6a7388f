//! Pending PHICH Acknowledgements
//!
//! An uplink grant in TTI n is acknowledged on the PHICH of TTI n+8 (FDD).
//! Grants of the target UE are parked in a 10-slot table indexed by the
//! acknowledgement subframe until the worker decoding that TTI reads it.

use common::{DciCandidate, Rnti, Tti};

/// Subframes between an uplink grant and its PHICH (FDD)
pub const PHICH_DELAY: u16 = 8;

/// Table slots, one per subframe index
pub const ACK_SLOTS: usize = 10;

/// Uplink grant awaiting its acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub grant_tti: Tti,
    pub ack_tti: Tti,
    pub rnti: Rnti,
    /// First CCE of the grant, used for the PHICH group mapping
    pub ncce: u32,
    pub prb_count: u8,
}

#[derive(Debug, Default)]
pub struct PendingAckTable {
    slots: [Option<PendingAck>; ACK_SLOTS],
    replaced: u64,
}

impl PendingAckTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an uplink grant decoded in `grant_tti`
    pub fn register(&mut self, grant_tti: Tti, grant: &DciCandidate) -> PendingAck {
        let ack_tti = grant_tti.add(PHICH_DELAY);
        let pending = PendingAck {
            grant_tti,
            ack_tti,
            rnti: grant.rnti,
            ncce: grant.ncce,
            prb_count: grant.prb_count,
        };
        let slot = &mut self.slots[ack_tti.subframe() as usize];
        if slot.is_some() {
            self.replaced += 1;
        }
        *slot = Some(pending);
        pending
    }

    /// Remove the entry acknowledged in `tti`; a stale entry in the same
    /// slot stays until overwritten
    pub fn take_due(&mut self, tti: Tti) -> Option<PendingAck> {
        let slot = &mut self.slots[tti.subframe() as usize];
        if slot.as_ref().is_some_and(|p| p.ack_tti == tti) {
            slot.take()
        } else {
            None
        }
    }

    /// Entries overwritten before their acknowledgement was read
    pub fn replaced(&self) -> u64 {
        self.replaced
    }
}

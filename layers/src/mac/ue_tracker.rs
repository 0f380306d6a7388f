//! UE Activity Tracker
//!
//! Sparse per-cell map of the C-RNTIs seen on the PDCCH. Each entry keeps
//! the new-data indicator of every HARQ process so retransmissions can be
//! told apart from new transport blocks. Entries idle for longer than the
//! inactivity timeout are evicted.

use common::{DciCandidate, LinkDirection, Rnti, SubframeDciSet, Tti};
use std::collections::HashMap;
use tracing::debug;

/// HARQ processes per direction (FDD)
pub const HARQ_PROCESSES: usize = 8;

/// Default inactivity before a UE is forgotten, in subframes
pub const DEFAULT_INACTIVITY: u16 = 3000;

/// Subframes between eviction sweeps
const SWEEP_PERIOD: u16 = 100;

#[derive(Debug, Clone)]
pub struct UeActivity {
    pub first_seen: Tti,
    pub last_seen: Tti,
    pub downlink_grants: u64,
    pub uplink_grants: u64,
    pub retransmissions: u64,
    dl_ndi: [Option<bool>; HARQ_PROCESSES],
    ul_ndi: [Option<bool>; HARQ_PROCESSES],
}

impl UeActivity {
    fn new(tti: Tti) -> Self {
        Self {
            first_seen: tti,
            last_seen: tti,
            downlink_grants: 0,
            uplink_grants: 0,
            retransmissions: 0,
            dl_ndi: [None; HARQ_PROCESSES],
            ul_ndi: [None; HARQ_PROCESSES],
        }
    }

    /// Record a grant and report whether it retransmits
    fn observe(&mut self, tti: Tti, dci: &DciCandidate) -> bool {
        self.last_seen = tti;
        let harq = dci.harq_id as usize % HARQ_PROCESSES;
        let tb = &dci.tb[0];
        let ndi = match dci.direction {
            LinkDirection::Downlink => {
                self.downlink_grants += 1;
                &mut self.dl_ndi[harq]
            }
            LinkDirection::Uplink => {
                self.uplink_grants += 1;
                &mut self.ul_ndi[harq]
            }
        };

        let retransmission = tb.rv != 0 || *ndi == Some(tb.ndi);
        *ndi = Some(tb.ndi);
        if retransmission {
            self.retransmissions += 1;
        }
        retransmission
    }
}

pub struct UeTracker {
    ues: HashMap<Rnti, UeActivity>,
    inactivity: u16,
    last_sweep: Option<Tti>,
    evicted: u64,
}

impl UeTracker {
    pub fn new(inactivity: u16) -> Self {
        Self {
            ues: HashMap::new(),
            inactivity: inactivity.clamp(1, common::TTI_WRAP / 2 - 1),
            last_sweep: None,
            evicted: 0,
        }
    }

    /// Update activity from one subframe, in TTI order, and set the
    /// retransmission flag of every C-RNTI grant
    pub fn annotate(&mut self, set: &mut SubframeDciSet) {
        let tti = set.tti;
        for dci in set.downlink.iter_mut().chain(set.uplink.iter_mut()) {
            if !dci.rnti.is_ue() {
                continue;
            }
            if dci.direction == LinkDirection::Uplink {
                // Synchronous uplink HARQ: the process follows the subframe
                dci.harq_id = (tti.value() as usize % HARQ_PROCESSES) as u8;
            }
            let ue = self.ues.entry(dci.rnti).or_insert_with(|| {
                debug!("New UE {} at TTI {}", dci.rnti, tti);
                UeActivity::new(tti)
            });
            dci.retransmission = ue.observe(tti, dci);
        }
        self.maybe_sweep(tti);
    }

    fn maybe_sweep(&mut self, now: Tti) {
        let due = match self.last_sweep {
            None => true,
            Some(last) => last.distance_to(now) >= SWEEP_PERIOD,
        };
        if due {
            self.evict_inactive(now);
            self.last_sweep = Some(now);
        }
    }

    /// Drop UEs idle for longer than the inactivity timeout
    pub fn evict_inactive(&mut self, now: Tti) -> usize {
        let before = self.ues.len();
        let inactivity = self.inactivity;
        self.ues.retain(|_, ue| {
            !(now.is_after(ue.last_seen) && ue.last_seen.distance_to(now) > inactivity)
        });
        let evicted = before - self.ues.len();
        if evicted > 0 {
            debug!("Evicted {} inactive UEs at TTI {}", evicted, now);
            self.evicted += evicted as u64;
        }
        evicted
    }

    pub fn get(&self, rnti: Rnti) -> Option<&UeActivity> {
        self.ues.get(&rnti)
    }

    pub fn active_count(&self) -> usize {
        self.ues.len()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for UeTracker {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY)
    }
}

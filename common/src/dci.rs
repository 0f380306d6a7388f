//! Decoded DCI records
//!
//! These are produced by the blind search in `layers` and consumed by the
//! exporters in `interfaces`.

use crate::types::{CellIndex, DciFormat, LinkDirection, Rnti, Tti};
use serde::{Deserialize, Serialize};

/// Maximum DCI messages kept per direction for one subframe
pub const MAX_DCI_PER_SUBFRAME: usize = 10;

/// Maximum transport blocks scheduled by one grant
pub const MAX_TRANSPORT_BLOCKS: usize = 2;

/// Per transport block scheduling fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportBlock {
    /// Modulation and coding scheme
    pub mcs: u8,
    /// Redundancy version (0-3)
    pub rv: u8,
    /// Transport block size in bits
    pub tbs: u32,
    /// New data indicator
    pub ndi: bool,
}

/// One DCI message accepted by the blind search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DciCandidate {
    pub format: DciFormat,
    /// RNTI recovered from the CRC mask
    pub rnti: Rnti,
    /// Aggregation level (0-3) of the location it was decoded at
    pub aggregation_level: u8,
    /// First CCE of that location
    pub ncce: u32,
    /// Allocated resource blocks
    pub prb_count: u8,
    pub harq_id: u8,
    pub tb: [TransportBlock; MAX_TRANSPORT_BLOCKS],
    /// Decoder success probability (0.0-1.0)
    pub decode_prob: f32,
    /// Re-encoding correlation against the received soft bits
    pub correlation: f32,
    pub direction: LinkDirection,
    /// Set by the UE tracker when the grant repeats a pending transport block
    pub retransmission: bool,
}

impl DciCandidate {
    /// Sum of the scheduled transport block sizes
    pub fn total_tbs(&self) -> u32 {
        self.tb.iter().map(|tb| tb.tbs).sum()
    }
}

/// All DCI messages found in one subframe of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubframeDciSet {
    pub cell: CellIndex,
    pub tti: Tti,
    /// Cell bandwidth in resource blocks
    pub cell_prb: u8,
    /// Acquisition time of the subframe
    pub timestamp_us: u64,
    pub downlink: Vec<DciCandidate>,
    pub uplink: Vec<DciCandidate>,
    /// PHICH result for an earlier uplink grant of the target UE
    pub ul_ack: Option<bool>,
    /// Stand-in for a subframe whose samples were never decoded
    pub placeholder: bool,
}

impl SubframeDciSet {
    pub fn new(cell: CellIndex, tti: Tti, cell_prb: u8, timestamp_us: u64) -> Self {
        Self {
            cell,
            tti,
            cell_prb,
            timestamp_us,
            downlink: Vec::new(),
            uplink: Vec::new(),
            ul_ack: None,
            placeholder: false,
        }
    }

    /// Empty entry for a subframe that had to be skipped
    pub fn placeholder(cell: CellIndex, tti: Tti, cell_prb: u8) -> Self {
        Self {
            placeholder: true,
            ..Self::new(cell, tti, cell_prb, 0)
        }
    }

    /// Add a message, keeping at most one per RNTI and direction.
    ///
    /// A duplicate replaces the stored entry only when it correlates better.
    /// Returns `false` when the direction is already at capacity.
    pub fn push(&mut self, dci: DciCandidate) -> bool {
        let list = match dci.direction {
            LinkDirection::Downlink => &mut self.downlink,
            LinkDirection::Uplink => &mut self.uplink,
        };

        if let Some(existing) = list.iter_mut().find(|d| d.rnti == dci.rnti) {
            if dci.correlation > existing.correlation {
                *existing = dci;
            }
            return true;
        }

        if list.len() >= MAX_DCI_PER_SUBFRAME {
            return false;
        }
        list.push(dci);
        true
    }

    pub fn len(&self) -> usize {
        self.downlink.len() + self.uplink.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downlink.is_empty() && self.uplink.is_empty()
    }

    /// Message for `rnti` in one direction
    pub fn find(&self, rnti: Rnti, direction: LinkDirection) -> Option<&DciCandidate> {
        match direction {
            LinkDirection::Downlink => self.downlink.iter().find(|d| d.rnti == rnti),
            LinkDirection::Uplink => self.uplink.iter().find(|d| d.rnti == rnti),
        }
    }

    /// Resource blocks granted across all messages of one direction
    pub fn allocated_prb(&self, direction: LinkDirection) -> u32 {
        let list = match direction {
            LinkDirection::Downlink => &self.downlink,
            LinkDirection::Uplink => &self.uplink,
        };
        list.iter().map(|d| d.prb_count as u32).sum()
    }
}

/// One TTI confirmed across every monitored cell
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTti {
    pub tti: Tti,
    /// Indexed by cell; `None` when the cell produced nothing for this TTI
    pub cells: Vec<Option<SubframeDciSet>>,
}

impl AggregatedTti {
    /// Entries that carry a decoded subframe
    pub fn decoded(&self) -> impl Iterator<Item = &SubframeDciSet> {
        self.cells.iter().flatten()
    }
}

/// Downstream consumer of aggregated TTIs (logger, remote sink)
pub trait TtiSubscriber: Send {
    /// Hand over one TTI; must not block for long
    fn deliver(&mut self, tti: &AggregatedTti);
}

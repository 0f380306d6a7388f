//! PHY Library Boundary
//!
//! The blind search never touches samples itself. Channel estimation, soft
//! demodulation, channel decoding and CRC handling all sit behind
//! `PdcchPhy`; one instance serves one decoder thread.

use super::candidate_tree::CandidateLocation;
use crate::mac::harq::PendingAck;
use crate::LayerError;
use common::{CellIndex, DciFormat, Rnti, TransportBlock, Tti};
use interfaces::source::SubframeSamples;

/// Soft bits carried by one CCE (9 REGs x 4 REs x QPSK)
pub const SOFT_BITS_PER_CCE: usize = 72;

/// Control region of one subframe
#[derive(Debug, Clone, Default)]
pub struct ControlRegion {
    /// Control format indicator (OFDM symbols used by the PDCCH)
    pub cfi: u8,
    /// CCEs available for PDCCH
    pub n_cce: u32,
    /// Soft bits (LLRs) of every CCE, `SOFT_BITS_PER_CCE` per CCE
    pub soft_bits: Vec<f32>,
}

impl ControlRegion {
    /// Soft bits covered by `count` CCEs starting at `ncce`, clamped to
    /// what was demodulated
    pub fn cce_bits(&self, ncce: u32, count: u32) -> &[f32] {
        let start = (ncce as usize * SOFT_BITS_PER_CCE).min(self.soft_bits.len());
        let end = ((ncce + count) as usize * SOFT_BITS_PER_CCE).min(self.soft_bits.len());
        &self.soft_bits[start..end]
    }
}

/// Output of the channel decoder for one location and format
#[derive(Debug, Clone)]
pub struct DecodedDci {
    pub format: DciFormat,
    /// RNTI recovered by unmasking the CRC
    pub rnti: Rnti,
    /// Hard-decision payload bits, one per byte
    pub bits: Vec<u8>,
    /// Decoder success probability (0.0-1.0)
    pub probability: f32,
}

/// Downlink assignment fields
#[derive(Debug, Clone, Default)]
pub struct DownlinkGrant {
    pub prb_count: u8,
    pub harq_id: u8,
    pub tb: [TransportBlock; 2],
}

/// Uplink grant fields
#[derive(Debug, Clone, Default)]
pub struct UplinkGrant {
    pub prb_count: u8,
    pub tb: TransportBlock,
}

/// Per-thread PHY primitives used by the blind search.
///
/// Calls after `estimate_control_region` refer to that subframe until the
/// next estimate.
pub trait PdcchPhy: Send {
    /// Estimate the channel and demodulate the control region
    fn estimate_control_region(&mut self, samples: &SubframeSamples, tti: Tti) -> Result<ControlRegion, LayerError>;

    /// Run the channel decoder at one location for one format
    fn decode_candidate(&mut self, location: &CandidateLocation, format: DciFormat) -> Result<DecodedDci, LayerError>;

    /// Re-encode `decoded` and correlate it against the received soft bits
    fn correlation(&mut self, location: &CandidateLocation, decoded: &DecodedDci) -> f32;

    /// Unpack a downlink assignment
    fn unpack_downlink(&self, decoded: &DecodedDci, cell_prb: u8) -> Result<DownlinkGrant, LayerError>;

    /// Unpack an uplink grant
    fn unpack_uplink(&self, decoded: &DecodedDci, cell_prb: u8) -> Result<UplinkGrant, LayerError>;

    /// Decode the broadcast channel, returning the system frame number
    fn decode_broadcast(&mut self, samples: &SubframeSamples) -> Option<u16>;

    /// Read the PHICH acknowledgement of an earlier uplink grant
    fn decode_ack(&mut self, _samples: &SubframeSamples, _ack: &PendingAck) -> Option<bool> {
        None
    }
}

/// Creates PHY instances, one per decoder thread
pub trait PhyFactory: Send + Sync {
    fn create(&self, cell: CellIndex) -> Result<Box<dyn PdcchPhy>, LayerError>;
}

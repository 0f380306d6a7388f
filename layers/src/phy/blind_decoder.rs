//! Blind DCI Decoder
//!
//! Decodes every searched format at a candidate location and keeps the
//! results whose re-encoding correlates with the received soft bits.

use super::backend::{DecodedDci, PdcchPhy};
use super::candidate_tree::{CandidateLocation, CandidateTree};
use crate::LayerError;
use common::{DciCandidate, DciFormat, LinkDirection, TransportBlock};
use tracing::{debug, trace};

/// Locations need at least this share of the best evidence in the subframe
pub const EVIDENCE_THRESHOLD_RATIO: f32 = 0.3;

/// Minimum re-encoding correlation of a kept decode
pub const MIN_CORRELATION: f32 = 0.5;

/// Minimum decoder probability surviving the final pruning pass
pub const MIN_DECODE_PROBABILITY: f32 = 0.75;

/// Decodes kept at one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeDecodes {
    pub downlink: usize,
    pub uplink: usize,
}

impl NodeDecodes {
    pub fn total(&self) -> usize {
        self.downlink + self.uplink
    }
}

/// Per-subframe decoder state
pub struct BlindDecoder {
    cell_prb: u8,
    threshold: f32,
    attempts: u64,
    failures: u64,
}

impl BlindDecoder {
    /// Decoder for one built tree; the evidence threshold follows its best location
    pub fn new(cell_prb: u8, tree: &CandidateTree) -> Self {
        Self {
            cell_prb,
            threshold: EVIDENCE_THRESHOLD_RATIO * tree.max_evidence(),
            attempts: 0,
            failures: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// PHY decode calls made so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Decode calls the PHY rejected
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Whether a node is still open and carries enough energy to try
    pub fn is_eligible(&self, tree: &CandidateTree, index: usize) -> bool {
        let location = tree.location(index);
        !location.is_checked() && location.evidence > self.threshold
    }

    /// Try every format at one node, storing accepted decodes in its slots
    pub fn decode_node(&mut self, phy: &mut dyn PdcchPhy, tree: &mut CandidateTree, index: usize) -> NodeDecodes {
        let mut decodes = NodeDecodes::default();
        if !self.is_eligible(tree, index) {
            return decodes;
        }

        let location = *tree.location(index);
        let formats = tree.formats().to_vec();
        for format in formats {
            self.attempts += 1;
            match self.decode_format(phy, &location, format) {
                Ok(Some(candidate)) => {
                    trace!(
                        "L{} CCE {} format {}: RNTI {} corr {:.2}",
                        location.aggregation_level, location.ncce, format, candidate.rnti, candidate.correlation
                    );
                    match candidate.direction {
                        LinkDirection::Downlink => decodes.downlink += 1,
                        LinkDirection::Uplink => decodes.uplink += 1,
                    }
                    tree.insert(index, candidate);
                }
                Ok(None) => {}
                Err(e) => {
                    self.failures += 1;
                    debug!("Decode at L{} CCE {} format {} failed: {}", location.aggregation_level, location.ncce, format, e);
                }
            }
        }
        decodes
    }

    /// Decode every eligible node of one block
    pub fn decode_block(&mut self, phy: &mut dyn PdcchPhy, tree: &mut CandidateTree, block: usize) -> NodeDecodes {
        let mut total = NodeDecodes::default();
        for index in tree.block_nodes(block) {
            let d = self.decode_node(phy, tree, index);
            total.downlink += d.downlink;
            total.uplink += d.uplink;
        }
        total
    }

    fn decode_format(
        &self,
        phy: &mut dyn PdcchPhy,
        location: &CandidateLocation,
        format: DciFormat,
    ) -> Result<Option<DciCandidate>, LayerError> {
        let decoded = phy.decode_candidate(location, format)?;
        let correlation = phy.correlation(location, &decoded);
        if !correlation.is_finite() || correlation < MIN_CORRELATION {
            return Ok(None);
        }
        self.to_candidate(phy, location, &decoded, correlation).map(Some)
    }

    fn to_candidate(
        &self,
        phy: &dyn PdcchPhy,
        location: &CandidateLocation,
        decoded: &DecodedDci,
        correlation: f32,
    ) -> Result<DciCandidate, LayerError> {
        let direction = decoded.format.direction();
        let (prb_count, harq_id, tb) = match direction {
            LinkDirection::Downlink => {
                let grant = phy.unpack_downlink(decoded, self.cell_prb)?;
                (grant.prb_count, grant.harq_id, grant.tb)
            }
            LinkDirection::Uplink => {
                let grant = phy.unpack_uplink(decoded, self.cell_prb)?;
                (grant.prb_count, 0, [grant.tb, TransportBlock::default()])
            }
        };

        Ok(DciCandidate {
            format: decoded.format,
            rnti: decoded.rnti,
            aggregation_level: location.aggregation_level,
            ncce: location.ncce,
            prb_count,
            harq_id,
            tb,
            decode_prob: decoded.probability,
            correlation,
            direction,
            retransmission: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mac::harq::PendingAck;
    use crate::phy::backend::{ControlRegion, DownlinkGrant, UplinkGrant};
    use crate::phy::candidate_tree::NODES_PER_BLOCK;
    use common::{Rnti, Tti};
    use interfaces::source::SubframeSamples;
    use std::collections::HashMap;

    /// PHY answering from a fixed table of (level, ncce, format) decodes
    #[derive(Default)]
    pub(crate) struct TablePhy {
        pub decodes: HashMap<(u8, u32, DciFormat), (u16, f32, f32)>,
        pub calls: usize,
    }

    impl TablePhy {
        pub fn with(mut self, level: u8, ncce: u32, format: DciFormat, rnti: u16, correlation: f32) -> Self {
            self.decodes.insert((level, ncce, format), (rnti, correlation, 0.95));
            self
        }
    }

    impl PdcchPhy for TablePhy {
        fn estimate_control_region(&mut self, _samples: &SubframeSamples, _tti: Tti) -> Result<ControlRegion, LayerError> {
            Err(LayerError::ControlRegion("not used".to_string()))
        }

        fn decode_candidate(&mut self, location: &CandidateLocation, format: DciFormat) -> Result<DecodedDci, LayerError> {
            self.calls += 1;
            let (rnti, _, probability) = self
                .decodes
                .get(&(location.aggregation_level, location.ncce, format))
                .copied()
                .unwrap_or((0xBEEF, 0.1, 0.2));
            Ok(DecodedDci { format, rnti: Rnti(rnti), bits: Vec::new(), probability })
        }

        fn correlation(&mut self, location: &CandidateLocation, decoded: &DecodedDci) -> f32 {
            self.decodes
                .get(&(location.aggregation_level, location.ncce, decoded.format))
                .map(|d| d.1)
                .unwrap_or(0.1)
        }

        fn unpack_downlink(&self, _decoded: &DecodedDci, _cell_prb: u8) -> Result<DownlinkGrant, LayerError> {
            Ok(DownlinkGrant {
                prb_count: 6,
                harq_id: 2,
                tb: [TransportBlock { mcs: 10, rv: 0, tbs: 2024, ndi: true }, TransportBlock::default()],
            })
        }

        fn unpack_uplink(&self, _decoded: &DecodedDci, _cell_prb: u8) -> Result<UplinkGrant, LayerError> {
            Ok(UplinkGrant { prb_count: 3, tb: TransportBlock { mcs: 4, rv: 0, tbs: 256, ndi: false } })
        }

        fn decode_broadcast(&mut self, _samples: &SubframeSamples) -> Option<u16> {
            None
        }

        fn decode_ack(&mut self, _samples: &SubframeSamples, _ack: &PendingAck) -> Option<bool> {
            None
        }
    }

    /// Tree whose every node carries the same evidence
    pub(crate) fn flat_tree(n_cce: u32, formats: &[DciFormat]) -> CandidateTree {
        let mut tree = CandidateTree::new(n_cce, formats);
        for i in 0..tree.len() {
            tree.set_evidence(i, 1.0);
        }
        tree.mark_out_of_range();
        tree
    }

    #[test]
    fn test_decode_node_keeps_correlated_formats() {
        let mut phy = TablePhy::default()
            .with(3, 0, DciFormat::Format1A, 1234, 0.8)
            .with(3, 0, DciFormat::Format0, 1234, 0.49);
        let mut tree = flat_tree(8, &[DciFormat::Format0, DciFormat::Format1A]);
        let mut decoder = BlindDecoder::new(50, &tree);

        let decodes = decoder.decode_node(&mut phy, &mut tree, 0);
        assert_eq!(decodes, NodeDecodes { downlink: 1, uplink: 0 });
        let kept = tree.slot(0, DciFormat::Format1A).unwrap();
        assert_eq!(kept.rnti, Rnti(1234));
        assert_eq!(kept.aggregation_level, 3);
        assert_eq!(kept.tb[0].tbs, 2024);
        assert!(tree.slot(0, DciFormat::Format0).is_none());
        assert_eq!(decoder.attempts(), 2);
    }

    #[test]
    fn test_rejects_invalid_correlation() {
        let mut phy = TablePhy::default().with(3, 0, DciFormat::Format1A, 1234, f32::NAN);
        let mut tree = flat_tree(8, &[DciFormat::Format1A]);
        let mut decoder = BlindDecoder::new(50, &tree);
        assert_eq!(decoder.decode_node(&mut phy, &mut tree, 0).total(), 0);
    }

    #[test]
    fn test_low_evidence_is_not_decoded() {
        let mut phy = TablePhy::default().with(0, 7, DciFormat::Format1A, 1234, 0.9);
        let mut tree = CandidateTree::new(8, &[DciFormat::Format1A]);
        tree.set_evidence(0, 1.0);
        tree.set_evidence(14, 0.2);
        let mut decoder = BlindDecoder::new(50, &tree);
        assert!((decoder.threshold() - 0.3).abs() < 1e-6);

        assert_eq!(decoder.decode_node(&mut phy, &mut tree, 14).total(), 0);
        assert_eq!(phy.calls, 0);
    }

    #[test]
    fn test_checked_nodes_are_skipped() {
        let mut phy = TablePhy::default();
        let mut tree = flat_tree(8, &[DciFormat::Format1A]);
        (0..NODES_PER_BLOCK).for_each(|i| tree.mark_checked(i));
        let mut decoder = BlindDecoder::new(50, &tree);
        assert_eq!(decoder.decode_block(&mut phy, &mut tree, 0).total(), 0);
        assert_eq!(phy.calls, 0);
    }
}

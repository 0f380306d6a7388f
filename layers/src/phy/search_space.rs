//! Search Space Construction
//!
//! Builds the candidate tree of one subframe from its demodulated control
//! region and scores every location by the mean magnitude of its soft bits.

use super::backend::ControlRegion;
use super::candidate_tree::CandidateTree;
use common::DciFormat;
use tracing::trace;

/// Builds per-subframe candidate trees for a fixed set of formats
#[derive(Debug, Clone)]
pub struct SearchSpaceBuilder {
    formats: Vec<DciFormat>,
}

impl SearchSpaceBuilder {
    pub fn new(formats: &[DciFormat]) -> Self {
        Self {
            formats: formats.to_vec(),
        }
    }

    pub fn formats(&self) -> &[DciFormat] {
        &self.formats
    }

    /// Enumerate and score every location of the control region
    pub fn build(&self, region: &ControlRegion) -> CandidateTree {
        let mut tree = CandidateTree::new(region.n_cce, &self.formats);

        for index in 0..tree.len() {
            let location = *tree.location(index);
            let bits = region.cce_bits(location.ncce, location.cce_count());
            if bits.is_empty() {
                continue;
            }
            let evidence = bits.iter().map(|b| b.abs()).sum::<f32>() / bits.len() as f32;
            tree.set_evidence(index, evidence);
        }

        tree.mark_out_of_range();
        trace!(
            "Search space: {} CCEs, {} blocks, max evidence {:.3}",
            region.n_cce,
            tree.block_count(),
            tree.max_evidence()
        );
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::backend::SOFT_BITS_PER_CCE;
    use crate::phy::candidate_tree::NODES_PER_BLOCK;

    fn region(n_cce: u32, strong: &[u32]) -> ControlRegion {
        let mut soft_bits = vec![0.1f32; n_cce as usize * SOFT_BITS_PER_CCE];
        for cce in strong {
            let start = *cce as usize * SOFT_BITS_PER_CCE;
            soft_bits[start..start + SOFT_BITS_PER_CCE].iter_mut().for_each(|b| *b = -1.0);
        }
        ControlRegion { cfi: 2, n_cce, soft_bits }
    }

    #[test]
    fn test_fifty_cces() {
        let builder = SearchSpaceBuilder::new(&DciFormat::DEFAULT_SEARCH);
        let tree = builder.build(&region(50, &[]));
        assert_eq!(tree.block_count(), 7);
        assert_eq!(tree.len(), 105);

        let last = tree.block_nodes(6);
        let invalid_leaves: Vec<u32> = last
            .clone()
            .filter(|i| tree.location(*i).aggregation_level == 0 && tree.is_checked(*i))
            .map(|i| tree.location(i).ncce)
            .collect();
        assert_eq!(invalid_leaves, vec![50, 51, 52, 53, 54, 55]);
        assert!((0..6 * NODES_PER_BLOCK).all(|i| !tree.is_checked(i)));
    }

    #[test]
    fn test_evidence_is_mean_magnitude() {
        let builder = SearchSpaceBuilder::new(&[DciFormat::Format1A]);
        let tree = builder.build(&region(8, &[2, 3]));

        // L1 at CCE 2 covers exactly the strong CCEs
        assert!((tree.location(4).evidence - 1.0).abs() < 1e-6);
        // L2 at CCE 0 covers two strong and two weak CCEs
        assert!((tree.location(1).evidence - 0.55).abs() < 1e-6);
        assert!((tree.location(7).evidence - 0.1).abs() < 1e-6);
        assert!((tree.max_evidence() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_region() {
        let builder = SearchSpaceBuilder::new(&[DciFormat::Format1A]);
        let tree = builder.build(&ControlRegion::default());
        assert!(tree.is_empty());
        assert_eq!(tree.max_evidence(), 0.0);
    }
}

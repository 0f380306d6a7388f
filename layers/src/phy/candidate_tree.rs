//! PDCCH Candidate Tree
//!
//! The control region is cut into blocks of 8 CCEs. Each block holds every
//! candidate location of the four aggregation levels as a complete binary
//! tree of 15 nodes:
//!
//! ```text
//! local index   0           L3 (8 CCEs)
//!               1 2         L2 (4 CCEs)
//!               3 .. 6      L1 (2 CCEs)
//!               7 .. 14     L0 (1 CCE)
//! ```
//!
//! Children of local node `i` are `2i+1` and `2i+2`. Blocks are stored
//! back to back in one arena, so global index = `block * 15 + local`.
//! Every node carries one optional decode per searched format.

use common::{DciCandidate, DciFormat, Rnti};
use std::ops::Range;

/// CCEs spanned by one block
pub const CCES_PER_BLOCK: u32 = 8;

/// Nodes in one block
pub const NODES_PER_BLOCK: usize = 15;

/// Nodes with children (levels 3 to 1)
pub const INTERNAL_NODES: usize = 7;

/// Highest aggregation level (8 CCEs)
pub const MAX_AGGREGATION_LEVEL: u8 = 3;

/// Aggregation level of a block-local index
pub fn level_of(local: usize) -> u8 {
    match local {
        0 => 3,
        1..=2 => 2,
        3..=6 => 1,
        _ => 0,
    }
}

/// Position of a block-local index within its level
pub fn position_of(local: usize) -> u32 {
    let first = (1usize << (MAX_AGGREGATION_LEVEL - level_of(local))) - 1;
    (local - first) as u32
}

/// Left child of a block-local index
pub fn left_child(local: usize) -> Option<usize> {
    (local < INTERNAL_NODES).then(|| 2 * local + 1)
}

/// Right child of a block-local index
pub fn right_child(local: usize) -> Option<usize> {
    (local < INTERNAL_NODES).then(|| 2 * local + 2)
}

/// Parent of a block-local index
pub fn parent(local: usize) -> Option<usize> {
    (local > 0 && local < NODES_PER_BLOCK).then(|| (local - 1) / 2)
}

/// CCEs spanned at an aggregation level
pub fn cce_count(level: u8) -> u32 {
    1 << level
}

/// First CCE of a node
pub fn ncce_of(block: usize, local: usize) -> u32 {
    block as u32 * CCES_PER_BLOCK + position_of(local) * cce_count(level_of(local))
}

/// One blind-search location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateLocation {
    /// Aggregation level (0-3)
    pub aggregation_level: u8,
    /// First CCE
    pub ncce: u32,
    /// Mean soft-bit magnitude over the covered CCEs
    pub evidence: f32,
    checked: bool,
}

impl CandidateLocation {
    pub fn new(aggregation_level: u8, ncce: u32) -> Self {
        Self {
            aggregation_level,
            ncce,
            evidence: 0.0,
            checked: false,
        }
    }

    pub fn cce_count(&self) -> u32 {
        cce_count(self.aggregation_level)
    }

    /// One past the last CCE
    pub fn end_cce(&self) -> u32 {
        self.ncce + self.cce_count()
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }
}

#[derive(Debug, Clone)]
struct TreeNode {
    location: CandidateLocation,
    slots: Vec<Option<DciCandidate>>,
}

/// Arena of all candidate locations of one subframe
#[derive(Debug, Clone)]
pub struct CandidateTree {
    formats: Vec<DciFormat>,
    nodes: Vec<TreeNode>,
    n_cce: u32,
}

impl CandidateTree {
    /// Tree covering `n_cce` CCEs (rounded up to whole blocks) with one slot
    /// per format at every node
    pub fn new(n_cce: u32, formats: &[DciFormat]) -> Self {
        let blocks = n_cce.div_ceil(CCES_PER_BLOCK) as usize;
        let mut nodes = Vec::with_capacity(blocks * NODES_PER_BLOCK);
        for block in 0..blocks {
            for local in 0..NODES_PER_BLOCK {
                nodes.push(TreeNode {
                    location: CandidateLocation::new(level_of(local), ncce_of(block, local)),
                    slots: vec![None; formats.len()],
                });
            }
        }

        Self {
            formats: formats.to_vec(),
            nodes,
            n_cce,
        }
    }

    pub fn n_cce(&self) -> u32 {
        self.n_cce
    }

    pub fn formats(&self) -> &[DciFormat] {
        &self.formats
    }

    pub fn block_count(&self) -> usize {
        self.nodes.len() / NODES_PER_BLOCK
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Global indices of one block
    pub fn block_nodes(&self, block: usize) -> Range<usize> {
        block * NODES_PER_BLOCK..(block + 1) * NODES_PER_BLOCK
    }

    pub fn location(&self, index: usize) -> &CandidateLocation {
        &self.nodes[index].location
    }

    pub fn locations(&self) -> impl Iterator<Item = &CandidateLocation> {
        self.nodes.iter().map(|n| &n.location)
    }

    pub(crate) fn set_evidence(&mut self, index: usize, evidence: f32) {
        self.nodes[index].location.evidence = evidence;
    }

    /// Highest evidence of any node
    pub fn max_evidence(&self) -> f32 {
        self.nodes.iter().map(|n| n.location.evidence).fold(0.0, f32::max)
    }

    pub fn is_checked(&self, index: usize) -> bool {
        self.nodes[index].location.checked
    }

    /// Flag a node as resolved; there is no way back
    pub fn mark_checked(&mut self, index: usize) {
        self.nodes[index].location.checked = true;
    }

    pub fn format_index(&self, format: DciFormat) -> Option<usize> {
        self.formats.iter().position(|f| *f == format)
    }

    /// Decode stored at a node for one format
    pub fn slot(&self, index: usize, format: DciFormat) -> Option<&DciCandidate> {
        let f = self.format_index(format)?;
        self.nodes[index].slots[f].as_ref()
    }

    /// Every stored decode at a node
    pub fn slots(&self, index: usize) -> impl Iterator<Item = &DciCandidate> {
        self.nodes[index].slots.iter().flatten()
    }

    /// Store a decode in its format slot, returning what it replaced
    pub fn insert(&mut self, index: usize, candidate: DciCandidate) -> Option<DciCandidate> {
        let f = self.format_index(candidate.format)?;
        self.nodes[index].slots[f].replace(candidate)
    }

    /// Remove the decode of one format at a node
    pub fn take(&mut self, index: usize, format: DciFormat) -> Option<DciCandidate> {
        let f = self.format_index(format)?;
        self.nodes[index].slots[f].take()
    }

    fn clear_slots(&mut self, index: usize) {
        self.nodes[index].slots.iter_mut().for_each(|s| *s = None);
    }

    /// Mark a node and all of its descendants checked and wipe their slots
    pub fn mark_subtree_checked(&mut self, index: usize) {
        self.mark_checked(index);
        self.clear_slots(index);

        let base = index - index % NODES_PER_BLOCK;
        let local = index - base;
        if let (Some(left), Some(right)) = (left_child(local), right_child(local)) {
            self.mark_subtree_checked(base + left);
            self.mark_subtree_checked(base + right);
        }
    }

    /// Mark every ancestor of a node checked and wipe their slots
    pub fn mark_ancestors_checked(&mut self, index: usize) {
        let base = index - index % NODES_PER_BLOCK;
        let mut local = index - base;
        while let Some(up) = parent(local) {
            self.mark_checked(base + up);
            self.clear_slots(base + up);
            local = up;
        }
    }

    /// Retire a matched node: nothing overlapping it may match again
    pub fn consume_match(&mut self, index: usize) {
        self.mark_subtree_checked(index);
        self.mark_ancestors_checked(index);
    }

    /// Remove every decode addressed to `rnti` from unchecked nodes.
    /// Nodes that gave up a decode become checked.
    pub fn copy_by_identity(&mut self, rnti: Rnti) -> Vec<DciCandidate> {
        let mut found = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| !n.location.checked) {
            let before = found.len();
            for slot in node.slots.iter_mut() {
                if slot.as_ref().is_some_and(|c| c.rnti == rnti) {
                    found.extend(slot.take());
                }
            }
            if found.len() > before {
                node.location.checked = true;
            }
        }
        found
    }

    /// Drop stored decodes below either confidence bound; returns how many
    pub fn prune_low_confidence(&mut self, min_correlation: f32, min_probability: f32) -> usize {
        let mut removed = 0;
        for slot in self.nodes.iter_mut().flat_map(|n| n.slots.iter_mut()) {
            if slot
                .as_ref()
                .is_some_and(|c| c.correlation < min_correlation || c.decode_prob < min_probability)
            {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Stored decodes across the whole tree
    pub fn decoded_count(&self) -> usize {
        self.nodes.iter().map(|n| n.slots.iter().flatten().count()).sum()
    }

    /// Check leaves lying past the last real CCE, then every internal node
    /// whose two children are both checked
    pub fn mark_out_of_range(&mut self) {
        for block in 0..self.block_count() {
            let base = block * NODES_PER_BLOCK;
            for local in INTERNAL_NODES..NODES_PER_BLOCK {
                if self.nodes[base + local].location.end_cce() > self.n_cce {
                    self.mark_checked(base + local);
                }
            }
            for local in (0..INTERNAL_NODES).rev() {
                let (Some(left), Some(right)) = (left_child(local), right_child(local)) else {
                    continue;
                };
                if self.is_checked(base + left) && self.is_checked(base + right) {
                    self.mark_checked(base + local);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TransportBlock;

    const FORMATS: [DciFormat; 3] = [DciFormat::Format0, DciFormat::Format1A, DciFormat::Format1];

    fn candidate(format: DciFormat, rnti: u16, correlation: f32) -> DciCandidate {
        DciCandidate {
            format,
            rnti: Rnti(rnti),
            aggregation_level: 0,
            ncce: 0,
            prb_count: 4,
            harq_id: 1,
            tb: [TransportBlock { mcs: 5, rv: 0, tbs: 872, ndi: true }, TransportBlock::default()],
            decode_prob: 0.9,
            correlation,
            direction: format.direction(),
            retransmission: false,
        }
    }

    #[test]
    fn test_block_shape() {
        for local in 0..NODES_PER_BLOCK {
            if let (Some(l), Some(r)) = (left_child(local), right_child(local)) {
                assert!(l < NODES_PER_BLOCK && r < NODES_PER_BLOCK);
                assert_eq!(parent(l), Some(local));
                assert_eq!(parent(r), Some(local));
                assert_eq!(level_of(l) + 1, level_of(local));
            } else {
                assert!(local >= INTERNAL_NODES);
                assert_eq!(level_of(local), 0);
            }
        }
        assert_eq!(parent(0), None);
        assert_eq!(left_child(7), None);
        assert_eq!(right_child(14), None);
    }

    #[test]
    fn test_node_ncce() {
        assert_eq!(ncce_of(0, 0), 0);
        assert_eq!(ncce_of(0, 2), 4);
        assert_eq!(ncce_of(0, 6), 6);
        assert_eq!(ncce_of(2, 14), 23);
        assert_eq!(ncce_of(1, 4), 10);

        let tree = CandidateTree::new(16, &FORMATS);
        assert_eq!(tree.len(), 30);
        let levels: Vec<u8> = tree.locations().take(NODES_PER_BLOCK).map(|l| l.aggregation_level).collect();
        assert_eq!(levels, vec![3, 2, 2, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        // Children start at their parent's first CCE and split its span
        for block in 0..tree.block_count() {
            let base = block * NODES_PER_BLOCK;
            for local in 0..INTERNAL_NODES {
                let p = tree.location(base + local);
                let l = tree.location(base + 2 * local + 1);
                let r = tree.location(base + 2 * local + 2);
                assert_eq!(l.ncce, p.ncce);
                assert_eq!(r.ncce, p.ncce + p.cce_count() / 2);
            }
        }
    }

    #[test]
    fn test_partial_block_marks_out_of_range() {
        // 50 CCEs: seven blocks, the last one covering CCEs 48..56
        let mut tree = CandidateTree::new(50, &FORMATS);
        tree.mark_out_of_range();
        assert_eq!(tree.block_count(), 7);
        assert_eq!(tree.len(), 105);

        for block in 0..6 {
            assert!(tree.block_nodes(block).all(|i| !tree.is_checked(i)));
        }

        let base = 6 * NODES_PER_BLOCK;
        for local in 7..NODES_PER_BLOCK {
            let loc = tree.location(base + local);
            assert_eq!(loc.is_checked(), loc.ncce >= 50, "leaf at CCE {}", loc.ncce);
        }
        // L1: CCEs 48-49 valid, 50-51 / 52-53 / 54-55 have two invalid leaves
        assert!(!tree.is_checked(base + 3));
        assert!(tree.is_checked(base + 4));
        assert!(tree.is_checked(base + 5));
        assert!(tree.is_checked(base + 6));
        // L2 at CCE 48 keeps one valid child, L2 at CCE 52 has none
        assert!(!tree.is_checked(base + 1));
        assert!(tree.is_checked(base + 2));
        assert!(!tree.is_checked(base));
    }

    #[test]
    fn test_propagation_needs_both_children() {
        // 5 CCEs: leaves 5..7 invalid, L1 at CCE 4 keeps its valid left leaf
        let mut tree = CandidateTree::new(5, &FORMATS);
        tree.mark_out_of_range();
        let checked: Vec<usize> = (0..NODES_PER_BLOCK).filter(|i| tree.is_checked(*i)).collect();
        assert_eq!(checked, vec![6, 12, 13, 14]);
    }

    #[test]
    fn test_checked_is_monotone() {
        let mut tree = CandidateTree::new(8, &FORMATS);
        tree.mark_checked(3);
        tree.insert(3, candidate(DciFormat::Format1A, 77, 0.9));
        tree.mark_out_of_range();
        tree.prune_low_confidence(0.95, 0.95);
        assert!(tree.copy_by_identity(Rnti(77)).is_empty());
        assert!(tree.is_checked(3));
    }

    #[test]
    fn test_copy_by_identity_round_trip() {
        let mut tree = CandidateTree::new(16, &FORMATS);
        let mut inserted = candidate(DciFormat::Format1A, 1234, 0.8);
        inserted.aggregation_level = 1;
        inserted.ncce = 10;
        tree.insert(NODES_PER_BLOCK + 4, inserted.clone());
        tree.insert(NODES_PER_BLOCK + 5, candidate(DciFormat::Format1A, 999, 0.8));

        let found = tree.copy_by_identity(Rnti(1234));
        assert_eq!(found, vec![inserted]);
        assert!(tree.slot(NODES_PER_BLOCK + 4, DciFormat::Format1A).is_none());
        assert!(tree.copy_by_identity(Rnti(1234)).is_empty());
        assert!(tree.slot(NODES_PER_BLOCK + 5, DciFormat::Format1A).is_some());
    }

    #[test]
    fn test_consume_match_clears_descendants_and_ancestors() {
        let mut tree = CandidateTree::new(8, &FORMATS);
        for i in 0..NODES_PER_BLOCK {
            tree.insert(i, candidate(DciFormat::Format0, 500 + i as u16, 0.9));
        }
        tree.consume_match(1);

        // Node 1 covers 3, 4, 7..10; its only ancestor is the root
        let expected = [0, 1, 3, 4, 7, 8, 9, 10];
        for i in 0..NODES_PER_BLOCK {
            let consumed = expected.contains(&i);
            assert_eq!(tree.is_checked(i), consumed, "node {}", i);
            assert_eq!(tree.slot(i, DciFormat::Format0).is_none(), consumed, "node {}", i);
        }
    }

    #[test]
    fn test_prune_low_confidence() {
        let mut tree = CandidateTree::new(8, &FORMATS);
        tree.insert(0, candidate(DciFormat::Format0, 1, 0.4));
        let mut weak = candidate(DciFormat::Format1, 2, 0.9);
        weak.decode_prob = 0.5;
        tree.insert(1, weak);
        tree.insert(2, candidate(DciFormat::Format1A, 3, 0.9));
        assert_eq!(tree.prune_low_confidence(0.5, 0.75), 2);
        assert_eq!(tree.decoded_count(), 1);
    }
}

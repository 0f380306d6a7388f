//! Child-Parent Tree Matching
//!
//! A genuine DCI transmitted at aggregation level L usually also decodes
//! at its left child (same first CCE, half the CCEs). A false decode almost
//! never repeats the same RNTI at two levels. The matcher uses this to
//! separate real messages from noise, then retires every location
//! overlapping an accepted message.

use super::blind_decoder::{BlindDecoder, MIN_CORRELATION, MIN_DECODE_PROBABILITY};
use super::backend::PdcchPhy;
use super::candidate_tree::{left_child, CandidateTree, INTERNAL_NODES, NODES_PER_BLOCK};
use common::{DciCandidate, DciFormat, Rnti, SubframeDciSet};
use tracing::{debug, trace, warn};

/// CCEs of the common search space
pub const COMMON_SEARCH_SPACE_CCES: u32 = 16;

/// Outcome counters of one matcher run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchStats {
    /// System/paging/RA messages accepted at a block root
    pub root: usize,
    /// Messages confirmed by a child-parent pair
    pub paired: usize,
    /// Target messages found without a confirming pair
    pub solo: usize,
    /// Leftover decodes removed by the confidence pass
    pub pruned: usize,
    /// Accepted messages that did not fit the subframe set
    pub overflow: usize,
}

impl MatchStats {
    pub fn accepted(&self) -> usize {
        self.root + self.paired + self.solo
    }
}

enum RootSearch {
    /// Root outside the common search space or already resolved
    Skipped,
    /// Root decoded without a reserved RNTI
    Decoded,
    /// Reserved message taken, block retired
    Accepted,
}

struct PairMatch {
    index: usize,
    format: DciFormat,
    correlation: f32,
    is_target: bool,
}

/// Turns a scored candidate tree into the DCI set of a subframe
#[derive(Debug, Clone)]
pub struct TreeMatcher {
    target: Rnti,
}

impl TreeMatcher {
    /// `target` is the UE followed by the scanner; zero disables target rules
    pub fn new(target: Rnti) -> Self {
        Self { target }
    }

    pub fn target(&self) -> Rnti {
        self.target
    }

    fn is_target(&self, rnti: Rnti) -> bool {
        !self.target.is_zero() && rnti == self.target
    }

    /// Search, match and prune the whole tree, appending accepted messages
    /// to `out`. Only unchecked nodes are read.
    pub fn run(
        &self,
        phy: &mut dyn PdcchPhy,
        decoder: &mut BlindDecoder,
        tree: &mut CandidateTree,
        out: &mut SubframeDciSet,
    ) -> MatchStats {
        let mut stats = MatchStats::default();

        for block in 0..tree.block_count() {
            let base = block * NODES_PER_BLOCK;

            let root_decoded = match self.root_search(phy, decoder, tree, base, out, &mut stats) {
                RootSearch::Accepted => continue,
                RootSearch::Decoded => true,
                RootSearch::Skipped => false,
            };

            for index in tree.block_nodes(block) {
                if index != base || !root_decoded {
                    decoder.decode_node(phy, tree, index);
                }
            }

            for local in 0..INTERNAL_NODES {
                let Some(child_local) = left_child(local) else {
                    continue;
                };
                let (node, child) = (base + local, base + child_local);
                if tree.is_checked(node) || tree.is_checked(child) {
                    continue;
                }

                let Some(winner) = self.prune(self.pair_matches(tree, node, child)) else {
                    continue;
                };
                if let Some(dci) = tree.take(winner.index, winner.format) {
                    trace!(
                        "Pair match at L{} CCE {}: RNTI {} format {}",
                        dci.aggregation_level, dci.ncce, dci.rnti, dci.format
                    );
                    stats.paired += 1;
                    Self::emit(out, dci, &mut stats);
                }
                tree.consume_match(node);
            }
        }

        if !self.target.is_zero() {
            for dci in tree.copy_by_identity(self.target) {
                trace!("Solo target decode at L{} CCE {}", dci.aggregation_level, dci.ncce);
                stats.solo += 1;
                Self::emit(out, dci, &mut stats);
            }
        }

        stats.pruned = tree.prune_low_confidence(MIN_CORRELATION, MIN_DECODE_PROBABILITY);
        debug!(
            "Tree {}: {} root, {} paired, {} solo, {} pruned",
            out.tti, stats.root, stats.paired, stats.solo, stats.pruned
        );
        stats
    }

    /// Accept a reserved-RNTI message at a block root inside the common
    /// search space; the whole block is retired when one is found
    fn root_search(
        &self,
        phy: &mut dyn PdcchPhy,
        decoder: &mut BlindDecoder,
        tree: &mut CandidateTree,
        root: usize,
        out: &mut SubframeDciSet,
        stats: &mut MatchStats,
    ) -> RootSearch {
        if tree.is_checked(root) || tree.location(root).ncce >= COMMON_SEARCH_SPACE_CCES {
            return RootSearch::Skipped;
        }

        decoder.decode_node(phy, tree, root);

        let best = tree
            .slots(root)
            .filter(|c| c.rnti.is_reserved())
            .max_by(|a, b| a.correlation.total_cmp(&b.correlation))
            .map(|c| c.format);
        let Some(format) = best else {
            return RootSearch::Decoded;
        };

        if let Some(dci) = tree.take(root, format) {
            trace!("Common search space message for RNTI {} format {}", dci.rnti, dci.format);
            stats.root += 1;
            Self::emit(out, dci, stats);
        }
        tree.consume_match(root);
        RootSearch::Accepted
    }

    /// Formats agreeing between a node and its left child
    fn pair_matches(&self, tree: &CandidateTree, node: usize, child: usize) -> Vec<PairMatch> {
        let mut matches = Vec::new();
        for format in tree.formats() {
            let (Some(upper), Some(lower)) = (tree.slot(node, *format), tree.slot(child, *format)) else {
                continue;
            };

            let chosen: Option<(usize, &DciCandidate, bool)> = if self.is_target(upper.rnti) {
                Some((node, upper, true))
            } else if self.is_target(lower.rnti) {
                Some((child, lower, true))
            } else if !upper.rnti.is_zero() && upper.rnti == lower.rnti {
                Some((node, upper, false))
            } else {
                None
            };

            if let Some((index, dci, is_target)) = chosen {
                matches.push(PairMatch {
                    index,
                    format: *format,
                    correlation: dci.correlation,
                    is_target,
                });
            }
        }
        matches
    }

    /// Pick one message out of the agreeing formats: target first, then an
    /// uplink grant, then the best correlation
    fn prune(&self, matches: Vec<PairMatch>) -> Option<PairMatch> {
        let best = |set: Vec<PairMatch>| set.into_iter().max_by(|a, b| a.correlation.total_cmp(&b.correlation));

        let (targets, others): (Vec<_>, Vec<_>) = matches.into_iter().partition(|m| m.is_target);
        if !targets.is_empty() {
            return best(targets);
        }

        let (uplink, downlink): (Vec<_>, Vec<_>) = others.into_iter().partition(|m| m.format.is_uplink());
        if !uplink.is_empty() {
            return best(uplink);
        }
        best(downlink)
    }

    fn emit(out: &mut SubframeDciSet, dci: DciCandidate, stats: &mut MatchStats) {
        let rnti = dci.rnti;
        if !out.push(dci) {
            stats.overflow += 1;
            warn!("DCI set for TTI {} is full, dropping RNTI {}", out.tti, rnti);
        }
    }
}

//! Physical Layer (PHY) Submodules
//!
//! Blind PDCCH search for LTE: candidate enumeration over the control
//! region, per-format decoding through the PHY boundary trait, and
//! child-parent matching to keep only genuine DCIs.

pub mod backend;
pub mod candidate_tree;
pub mod search_space;
pub mod blind_decoder;
pub mod tree_matcher;
pub mod sim;

// Re-export commonly used types
pub use backend::{ControlRegion, DecodedDci, DownlinkGrant, PdcchPhy, PhyFactory, UplinkGrant};
pub use blind_decoder::BlindDecoder;
pub use candidate_tree::{CandidateLocation, CandidateTree};
pub use search_space::SearchSpaceBuilder;
pub use sim::{SimulatedPhy, SimulatedPhyConfig, SimulatedPhyFactory, Traffic};
pub use tree_matcher::{MatchStats, TreeMatcher};

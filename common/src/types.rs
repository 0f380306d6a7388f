//! Common Types for the LTE DCI scanner
//!
//! Defines fundamental types shared by the search engine, the pipeline and
//! the output interfaces

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

/// Number of distinct TTI values before the counter wraps (1024 frames x 10 subframes)
pub const TTI_WRAP: u16 = 10240;

/// Number of subframes in one radio frame
pub const SUBFRAMES_PER_FRAME: u16 = 10;

/// Number of system frame numbers before SFN wraps
pub const SFN_WRAP: u16 = 1024;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// System information RNTI
    pub const SI: Self = Self(0xFFFF);
    /// Paging RNTI
    pub const P: Self = Self(0xFFFE);
    /// MBMS RNTI
    pub const M: Self = Self(0xFFFD);
    /// Single-cell MBMS RNTI
    pub const SC: Self = Self(0xFFFC);
    /// Start of the range reserved for future use
    pub const RESERVED_START: u16 = 0xFFF4;
    /// Highest RA-RNTI value (1 + t_id + 10 * f_id, FDD)
    pub const RA_MAX: u16 = 60;

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Zero is never assigned and is what a failed decode reports
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Random access RNTI window
    pub fn is_random_access(&self) -> bool {
        (1..=Self::RA_MAX).contains(&self.0)
    }

    /// RNTIs carrying system, paging, MBMS or random access messages
    pub fn is_reserved(&self) -> bool {
        self.0 >= Self::RESERVED_START || self.is_random_access()
    }

    /// A C-RNTI that may belong to a connected UE
    pub fn is_ue(&self) -> bool {
        !self.is_zero() && !self.is_reserved()
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a monitored cell (one per radio front-end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CellIndex(pub u8);

impl CellIndex {
    /// Index as usize for table lookups
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transmission time interval counter, `sfn * 10 + subframe` modulo 10240
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tti(u16);

impl Tti {
    /// Create a TTI, wrapping out-of-range values
    pub fn new(value: u32) -> Self {
        Self((value % TTI_WRAP as u32) as u16)
    }

    /// Build from system frame number and subframe index
    pub fn from_frame(sfn: u16, subframe: u8) -> Self {
        Self::new((sfn % SFN_WRAP) as u32 * SUBFRAMES_PER_FRAME as u32 + subframe as u32)
    }

    /// Raw counter value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// System frame number of this TTI
    pub fn sfn(&self) -> u16 {
        self.0 / SUBFRAMES_PER_FRAME
    }

    /// Subframe index (0-9) of this TTI
    pub fn subframe(&self) -> u8 {
        (self.0 % SUBFRAMES_PER_FRAME) as u8
    }

    /// TTI `n` subframes later
    pub fn add(&self, n: u16) -> Self {
        Self::new(self.0 as u32 + (n % TTI_WRAP) as u32)
    }

    /// TTI `n` subframes earlier
    pub fn sub(&self, n: u16) -> Self {
        Self::new(self.0 as u32 + TTI_WRAP as u32 - (n % TTI_WRAP) as u32)
    }

    /// Next TTI
    pub fn next(&self) -> Self {
        self.add(1)
    }

    /// Previous TTI
    pub fn prev(&self) -> Self {
        self.sub(1)
    }

    /// Forward distance from `self` to `later`, in `0..10240`
    pub fn distance_to(&self, later: Tti) -> u16 {
        ((later.0 as u32 + TTI_WRAP as u32 - self.0 as u32) % TTI_WRAP as u32) as u16
    }

    /// Wraparound-aware ordering: `self` lies strictly after `other` when the
    /// forward distance from `other` is less than half the counter range
    pub fn is_after(&self, other: Tti) -> bool {
        let d = other.distance_to(*self);
        d != 0 && d < TTI_WRAP / 2
    }

    /// The earlier of two TTIs under wraparound-aware ordering
    pub fn earliest(self, other: Tti) -> Tti {
        if self.is_after(other) { other } else { self }
    }

    /// Slot of this TTI in a ring of `size` entries
    pub fn ring_index(&self, size: usize) -> usize {
        self.0 as usize % size
    }
}

impl fmt::Display for Tti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// LTE DCI formats searched for on the PDCCH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum DciFormat {
    /// Uplink grant
    #[serde(rename = "0")]
    Format0 = 0,
    /// Downlink SIMO
    #[serde(rename = "1")]
    Format1 = 1,
    /// Downlink compact
    #[serde(rename = "1A")]
    Format1A = 2,
    /// Downlink very compact (paging, RACH response)
    #[serde(rename = "1C")]
    Format1C = 3,
    /// Downlink closed-loop MIMO
    #[serde(rename = "2")]
    Format2 = 4,
    /// Downlink open-loop MIMO
    #[serde(rename = "2A")]
    Format2A = 5,
    /// Uplink MIMO grant
    #[serde(rename = "4")]
    Format4 = 6,
}

impl DciFormat {
    /// Formats searched when the configuration does not narrow them
    pub const DEFAULT_SEARCH: [DciFormat; 5] = [
        DciFormat::Format0,
        DciFormat::Format1A,
        DciFormat::Format1,
        DciFormat::Format2A,
        DciFormat::Format2,
    ];

    /// Direction of the grant carried by this format
    pub fn direction(&self) -> LinkDirection {
        match self {
            DciFormat::Format0 | DciFormat::Format4 => LinkDirection::Uplink,
            _ => LinkDirection::Downlink,
        }
    }

    /// Uplink grant formats
    pub fn is_uplink(&self) -> bool {
        self.direction() == LinkDirection::Uplink
    }

    /// Number of transport blocks the format can schedule
    pub fn max_transport_blocks(&self) -> usize {
        match self {
            DciFormat::Format2 | DciFormat::Format2A | DciFormat::Format4 => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for DciFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DciFormat::Format0 => "0",
            DciFormat::Format1 => "1",
            DciFormat::Format1A => "1A",
            DciFormat::Format1C => "1C",
            DciFormat::Format2 => "2",
            DciFormat::Format2A => "2A",
            DciFormat::Format4 => "4",
        };
        write!(f, "{}", name)
    }
}

/// Direction of a scheduling grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    /// PDSCH assignment
    Downlink,
    /// PUSCH grant
    Uplink,
}

/// LTE channel bandwidth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 1.4 MHz
    Bw1_4,
    /// 3 MHz
    Bw3,
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 15 MHz
    Bw15,
    /// 20 MHz
    Bw20,
}

impl Bandwidth {
    /// Number of downlink resource blocks
    pub fn prb(&self) -> u8 {
        match self {
            Bandwidth::Bw1_4 => 6,
            Bandwidth::Bw3 => 15,
            Bandwidth::Bw5 => 25,
            Bandwidth::Bw10 => 50,
            Bandwidth::Bw15 => 75,
            Bandwidth::Bw20 => 100,
        }
    }

    /// Bandwidth for a resource block count
    pub fn from_prb(prb: u8) -> Option<Self> {
        match prb {
            6 => Some(Bandwidth::Bw1_4),
            15 => Some(Bandwidth::Bw3),
            25 => Some(Bandwidth::Bw5),
            50 => Some(Bandwidth::Bw10),
            75 => Some(Bandwidth::Bw15),
            100 => Some(Bandwidth::Bw20),
            _ => None,
        }
    }

    /// Get the sample rate for this bandwidth
    pub fn to_sample_rate(&self) -> f64 {
        match self {
            Bandwidth::Bw1_4 => 1.92e6,
            Bandwidth::Bw3 => 3.84e6,
            Bandwidth::Bw5 => 7.68e6,
            Bandwidth::Bw10 => 15.36e6,
            Bandwidth::Bw15 => 23.04e6,
            Bandwidth::Bw20 => 30.72e6,
        }
    }

    /// IQ samples in one 1 ms subframe
    pub fn samples_per_subframe(&self) -> usize {
        (self.to_sample_rate() / 1000.0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_rnti_ranges() {
        assert!(Rnti::SI.is_reserved());
        assert!(Rnti::P.is_reserved());
        assert!(Rnti(0xFFF4).is_reserved());
        assert!(Rnti(2).is_reserved());
        assert!(!Rnti(0xFFF3).is_reserved());
        assert!(Rnti(1234).is_ue());
        assert!(!Rnti(0).is_ue());
    }

    #[test]
    fn test_tti_wraparound() {
        let last = Tti::new(10239);
        assert_eq!(last.next(), Tti::new(0));
        assert_eq!(Tti::new(0).prev(), last);
        assert!(Tti::new(0).is_after(last));
        assert!(!last.is_after(Tti::new(0)));
        assert_eq!(last.earliest(Tti::new(0)), last);
        assert_eq!(last.distance_to(Tti::new(5)), 6);
    }

    #[test]
    fn test_tti_from_frame() {
        let tti = Tti::from_frame(1023, 9);
        assert_eq!(tti.value(), 10239);
        assert_eq!(tti.sfn(), 1023);
        assert_eq!(tti.subframe(), 9);
        assert_eq!(Tti::from_frame(1024, 0).value(), 0);
    }

    #[test]
    fn test_format_direction() {
        assert!(DciFormat::Format0.is_uplink());
        assert!(DciFormat::Format4.is_uplink());
        assert!(!DciFormat::Format1A.is_uplink());
        assert_eq!(DciFormat::Format2A.max_transport_blocks(), 2);
        assert_eq!(DciFormat::Format1A.to_string(), "1A");
    }

    #[test]
    fn test_bandwidth_conversion() {
        assert_eq!(Bandwidth::Bw20.prb(), 100);
        assert_eq!(Bandwidth::from_prb(50), Some(Bandwidth::Bw10));
        assert_eq!(Bandwidth::Bw10.samples_per_subframe(), 15360);
    }
}

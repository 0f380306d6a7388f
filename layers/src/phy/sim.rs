//! Simulated PDCCH PHY
//!
//! Models which DCIs are on the air, not waveforms. Every TTI gets a
//! deterministic set of transmissions (scripted, or drawn from a seeded
//! RNG). A transmission decodes cleanly at its own location and, with
//! lower correlation, at its left child; every other location yields a
//! random payload whose unmasked CRC gives a random RNTI.

use super::backend::{ControlRegion, DecodedDci, DownlinkGrant, PdcchPhy, PhyFactory, UplinkGrant, SOFT_BITS_PER_CCE};
use super::candidate_tree::{cce_count, CandidateLocation};
use crate::mac::harq::PendingAck;
use crate::LayerError;
use common::{append_bits, crc16_bits, read_bits, CellIndex, DciFormat, Rnti, TransportBlock, Tti, SFN_WRAP};
use interfaces::source::SubframeSamples;
use num_traits::ToPrimitive;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Payload bits ahead of the CRC
const PAYLOAD_BITS: usize = 3 + 8 + 3 + 5 + 2 + 1 + 5 + 2 + 1;

/// Soft-bit magnitude of CCEs carrying a transmission
const SIGNAL_LEVEL: f32 = 1.0;

/// Soft-bit magnitude of empty CCEs
const NOISE_LEVEL: f32 = 0.1;

/// One DCI on the air
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDci {
    pub format: DciFormat,
    pub rnti: Rnti,
    pub aggregation_level: u8,
    pub ncce: u32,
    pub prb_count: u8,
    pub harq_id: u8,
    pub mcs: u8,
    pub rv: u8,
    pub ndi: bool,
}

impl SimulatedDci {
    fn covers(&self, cce: u32) -> bool {
        cce >= self.ncce && cce < self.ncce + cce_count(self.aggregation_level)
    }

    /// Payload followed by the RNTI-masked CRC
    fn encode(&self) -> Vec<u8> {
        let mut bits = Vec::with_capacity(PAYLOAD_BITS + 16);
        append_bits(&mut bits, self.format.to_u32().unwrap_or(0), 3);
        append_bits(&mut bits, self.prb_count as u32, 8);
        append_bits(&mut bits, self.harq_id as u32, 3);
        append_bits(&mut bits, self.mcs as u32, 5);
        append_bits(&mut bits, self.rv as u32, 2);
        append_bits(&mut bits, self.ndi as u32, 1);
        if self.format.max_transport_blocks() == 2 {
            append_bits(&mut bits, self.mcs.saturating_sub(2) as u32, 5);
            append_bits(&mut bits, self.rv as u32, 2);
            append_bits(&mut bits, !self.ndi as u32, 1);
        } else {
            append_bits(&mut bits, 0, 8);
        }
        let crc = crc16_bits(&bits) ^ self.rnti.value();
        append_bits(&mut bits, crc as u32, 16);
        bits
    }
}

/// Source of the transmissions of each TTI
#[derive(Debug, Clone)]
pub enum Traffic {
    /// Random UE-specific grants plus SIB1 on SI-RNTI
    Random {
        seed: u64,
        ues: Vec<Rnti>,
        max_per_subframe: usize,
    },
    /// Fixed transmissions keyed by TTI value
    Scripted(HashMap<u16, Vec<SimulatedDci>>),
}

/// Simulated cell parameters
#[derive(Debug, Clone)]
pub struct SimulatedPhyConfig {
    /// CCEs in every control region
    pub n_cce: u32,
    pub cfi: u8,
    pub cell_prb: u8,
    /// Formats used when drawing random grants
    pub formats: Vec<DciFormat>,
    /// SFN broadcast at source sequence 0
    pub sfn_offset: u16,
    pub traffic: Traffic,
}

impl SimulatedPhyConfig {
    /// Random traffic for a 10 MHz cell
    pub fn random(seed: u64, ues: Vec<Rnti>) -> Self {
        Self {
            n_cce: 42,
            cfi: 3,
            cell_prb: 50,
            formats: DciFormat::DEFAULT_SEARCH.to_vec(),
            sfn_offset: 0,
            traffic: Traffic::Random {
                seed,
                ues,
                max_per_subframe: 4,
            },
        }
    }
}

/// Rough transport block size for an MCS and allocation
pub fn approximate_tbs(mcs: u8, prb_count: u8) -> u32 {
    let modulation_order = match mcs {
        0..=9 => 2.0,
        10..=16 => 4.0,
        _ => 6.0,
    };
    let code_rate = (0.1 + mcs as f32 * 0.03).min(0.93);
    let bits = prb_count as f32 * 120.0 * modulation_order * code_rate;
    ((bits as u32) / 8 * 8).max(16)
}

/// PHY backed by simulated traffic
pub struct SimulatedPhy {
    cell: CellIndex,
    config: SimulatedPhyConfig,
    tti: Tti,
    on_air: Vec<SimulatedDci>,
    correlations: HashMap<(u8, u32, DciFormat), f32>,
}

impl SimulatedPhy {
    pub fn new(cell: CellIndex, config: SimulatedPhyConfig) -> Self {
        Self {
            cell,
            config,
            tti: Tti::default(),
            on_air: Vec::new(),
            correlations: HashMap::new(),
        }
    }

    /// Transmissions of one TTI
    pub fn transmissions(&self, tti: Tti) -> Vec<SimulatedDci> {
        match &self.config.traffic {
            Traffic::Scripted(script) => script.get(&tti.value()).cloned().unwrap_or_default(),
            Traffic::Random { seed, ues, max_per_subframe } => self.random_transmissions(tti, *seed, ues, *max_per_subframe),
        }
    }

    fn random_transmissions(&self, tti: Tti, seed: u64, ues: &[Rnti], max: usize) -> Vec<SimulatedDci> {
        let mut rng = StdRng::seed_from_u64(seed ^ tti.value() as u64 ^ ((self.cell.0 as u64) << 32));
        let n_cce = self.config.n_cce;
        let mut occupied = vec![false; n_cce as usize];
        let mut dcis = Vec::new();

        let mut place = |dci: SimulatedDci, occupied: &mut Vec<bool>| {
            (dci.ncce..dci.ncce + cce_count(dci.aggregation_level)).for_each(|c| occupied[c as usize] = true);
            dcis.push(dci);
        };

        // SIB1 in subframe 5 of even frames
        if tti.subframe() == 5 && tti.sfn() % 2 == 0 && n_cce >= 8 {
            place(
                SimulatedDci {
                    format: DciFormat::Format1A,
                    rnti: Rnti::SI,
                    aggregation_level: 3,
                    ncce: 0,
                    prb_count: 4,
                    harq_id: 0,
                    mcs: 5,
                    rv: 0,
                    ndi: false,
                },
                &mut occupied,
            );
        }

        let count = if ues.is_empty() { 0 } else { rng.gen_range(0..=max) };
        for _ in 0..count {
            let level: u8 = rng.gen_range(1..=3);
            let span = cce_count(level);
            let free: Vec<u32> = (0..n_cce / span)
                .map(|p| p * span)
                .filter(|start| (*start..start + span).all(|c| !occupied[c as usize]))
                .collect();
            let (Some(ncce), Some(rnti), Some(format)) =
                (free.choose(&mut rng), ues.choose(&mut rng), self.config.formats.choose(&mut rng))
            else {
                continue;
            };

            place(
                SimulatedDci {
                    format: *format,
                    rnti: *rnti,
                    aggregation_level: level,
                    ncce: *ncce,
                    prb_count: rng.gen_range(1..=self.config.cell_prb.max(1)),
                    harq_id: rng.gen_range(0..8),
                    mcs: rng.gen_range(0..=28),
                    rv: if rng.gen_bool(0.9) { 0 } else { rng.gen_range(1..4) },
                    ndi: rng.gen_bool(0.5),
                },
                &mut occupied,
            );
        }
        dcis
    }

    fn noise_payload(&self, location: &CandidateLocation, format: DciFormat) -> (Vec<u8>, f32, f32) {
        let key = ((self.tti.value() as u64) << 40)
            ^ ((location.ncce as u64) << 8)
            ^ ((location.aggregation_level as u64) << 4)
            ^ format.to_u64().unwrap_or(0);
        let mut rng = StdRng::seed_from_u64(key ^ self.cell.0 as u64);
        let bits = (0..PAYLOAD_BITS + 16).map(|_| rng.gen_range(0..=1u8)).collect();
        (bits, rng.gen_range(0.1..0.7), rng.gen_range(0.05..0.45))
    }

    fn field(bits: &[u8], offset: usize, width: u8) -> Result<u32, LayerError> {
        read_bits(bits, offset, width).ok_or_else(|| LayerError::CandidateDecode(format!("payload of {} bits", bits.len())))
    }
}

impl PdcchPhy for SimulatedPhy {
    fn estimate_control_region(&mut self, _samples: &SubframeSamples, tti: Tti) -> Result<ControlRegion, LayerError> {
        self.tti = tti;
        self.on_air = self.transmissions(tti);
        self.correlations.clear();

        let n_cce = self.config.n_cce;
        let mut soft_bits = Vec::with_capacity(n_cce as usize * SOFT_BITS_PER_CCE);
        for cce in 0..n_cce {
            let level = if self.on_air.iter().any(|d| d.covers(cce)) { SIGNAL_LEVEL } else { NOISE_LEVEL };
            soft_bits.extend((0..SOFT_BITS_PER_CCE).map(|i| if i % 2 == 0 { level } else { -level }));
        }

        trace!("Cell {} TTI {}: {} DCIs on air", self.cell, tti, self.on_air.len());
        Ok(ControlRegion {
            cfi: self.config.cfi,
            n_cce,
            soft_bits,
        })
    }

    fn decode_candidate(&mut self, location: &CandidateLocation, format: DciFormat) -> Result<DecodedDci, LayerError> {
        let hit = self.on_air.iter().find_map(|d| {
            if d.format != format || d.ncce != location.ncce {
                None
            } else if d.aggregation_level == location.aggregation_level {
                Some((d.encode(), 0.98, 0.9))
            } else if d.aggregation_level == location.aggregation_level + 1 {
                Some((d.encode(), 0.9, 0.65))
            } else {
                None
            }
        });
        let (bits, probability, correlation) = hit.unwrap_or_else(|| self.noise_payload(location, format));

        let crc = Self::field(&bits, PAYLOAD_BITS, 16)? as u16;
        let rnti = Rnti(crc ^ crc16_bits(&bits[..PAYLOAD_BITS]));
        self.correlations.insert((location.aggregation_level, location.ncce, format), correlation);

        Ok(DecodedDci {
            format,
            rnti,
            bits,
            probability,
        })
    }

    fn correlation(&mut self, location: &CandidateLocation, decoded: &DecodedDci) -> f32 {
        self.correlations
            .get(&(location.aggregation_level, location.ncce, decoded.format))
            .copied()
            .unwrap_or(f32::NAN)
    }

    fn unpack_downlink(&self, decoded: &DecodedDci, cell_prb: u8) -> Result<DownlinkGrant, LayerError> {
        let bits = &decoded.bits;
        let prb_count = (Self::field(bits, 3, 8)? as u8).min(cell_prb);
        let harq_id = Self::field(bits, 11, 3)? as u8;
        let mcs0 = Self::field(bits, 14, 5)? as u8;
        let rv0 = Self::field(bits, 19, 2)? as u8;
        let ndi0 = Self::field(bits, 21, 1)? != 0;

        let mut tb = [
            TransportBlock { mcs: mcs0, rv: rv0, tbs: approximate_tbs(mcs0, prb_count), ndi: ndi0 },
            TransportBlock::default(),
        ];
        if decoded.format.max_transport_blocks() == 2 {
            let mcs1 = Self::field(bits, 22, 5)? as u8;
            tb[1] = TransportBlock {
                mcs: mcs1,
                rv: Self::field(bits, 27, 2)? as u8,
                tbs: approximate_tbs(mcs1, prb_count),
                ndi: Self::field(bits, 29, 1)? != 0,
            };
        }

        Ok(DownlinkGrant { prb_count, harq_id, tb })
    }

    fn unpack_uplink(&self, decoded: &DecodedDci, cell_prb: u8) -> Result<UplinkGrant, LayerError> {
        let bits = &decoded.bits;
        let prb_count = (Self::field(bits, 3, 8)? as u8).min(cell_prb);
        let mcs = Self::field(bits, 14, 5)? as u8;
        Ok(UplinkGrant {
            prb_count,
            tb: TransportBlock {
                mcs,
                rv: Self::field(bits, 19, 2)? as u8,
                tbs: approximate_tbs(mcs, prb_count),
                ndi: Self::field(bits, 21, 1)? != 0,
            },
        })
    }

    fn decode_broadcast(&mut self, samples: &SubframeSamples) -> Option<u16> {
        if samples.sequence % 10 != 0 {
            return None;
        }
        let sfn = ((samples.sequence / 10 + self.config.sfn_offset as u64) % SFN_WRAP as u64) as u16;
        debug!("Cell {}: MIB decoded, SFN {}", self.cell, sfn);
        Some(sfn)
    }

    fn decode_ack(&mut self, _samples: &SubframeSamples, ack: &PendingAck) -> Option<bool> {
        Some(ack.grant_tti.value() % 5 != 0)
    }
}

/// Hands out simulated PHYs sharing one configuration
pub struct SimulatedPhyFactory {
    config: SimulatedPhyConfig,
}

impl SimulatedPhyFactory {
    pub fn new(config: SimulatedPhyConfig) -> Self {
        Self { config }
    }
}

impl PhyFactory for SimulatedPhyFactory {
    fn create(&self, cell: CellIndex) -> Result<Box<dyn PdcchPhy>, LayerError> {
        if self.config.n_cce == 0 {
            return Err(LayerError::PhyInit("simulated cell has no CCEs".to_string()));
        }
        Ok(Box::new(SimulatedPhy::new(cell, self.config.clone())))
    }
}

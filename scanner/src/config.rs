//! YAML Configuration Structures
//!
//! One `radios` entry per monitored cell, plus optional sections for the
//! decoder, the pipeline buffers, the DCI logs and the remote sink.

use common::{Bandwidth, DciFormat, Rnti};
use interfaces::dci_log::LogFlags;
use layers::mac::pipeline::MAX_FRONT_ENDS;
use layers::mac::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Monitored cells, in cell index order
    pub radios: Vec<RadioConfig>,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub log: LogConfig,
    /// UDP export of the target UE's grants
    #[serde(default)]
    pub remote_sink: Option<RemoteSinkSection>,
}

/// One radio front-end
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RadioConfig {
    pub source: SourceConfig,
    /// Downlink carrier, informational
    #[serde(default)]
    pub center_frequency_hz: Option<f64>,
    /// Cell bandwidth in resource blocks (6, 15, 25, 50, 75 or 100)
    pub prb: u8,
    /// Traffic model of the simulated PHY
    #[serde(default)]
    pub phy: SimulatedPhySection,
}

/// Where the IQ samples come from
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// srsRAN-style ZMQ stream, e.g. "rx_port=tcp://localhost:2001,base_srate=11.52e6"
    Zmq { device_args: String },
    /// Raw cf32 capture at the cell's native rate
    File { path: PathBuf },
    /// Paced clock without samples
    Simulated {
        #[serde(default)]
        limit: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatedPhySection {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// C-RNTIs drawing random grants
    #[serde(default)]
    pub ues: Vec<u16>,
    /// CCEs per control region; derived from the bandwidth when absent
    #[serde(default)]
    pub n_cce: Option<u32>,
    #[serde(default = "default_max_per_subframe")]
    pub max_per_subframe: usize,
    #[serde(default)]
    pub sfn_offset: u16,
}

fn default_seed() -> u64 {
    1
}

fn default_max_per_subframe() -> usize {
    4
}

impl Default for SimulatedPhySection {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            ues: Vec::new(),
            n_cce: None,
            max_per_subframe: default_max_per_subframe(),
            sfn_offset: 0,
        }
    }
}

/// Decoder configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecoderConfig {
    #[serde(default = "default_workers")]
    pub workers_per_radio: usize,
    /// UE followed for solo decodes, PHICH and export; 0 for none
    #[serde(default)]
    pub target_rnti: u16,
    #[serde(default = "default_formats")]
    pub formats: Vec<DciFormat>,
}

fn default_workers() -> usize {
    4
}

fn default_formats() -> Vec<DciFormat> {
    DciFormat::DEFAULT_SEARCH.to_vec()
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            workers_per_radio: default_workers(),
            target_rnti: 0,
            formats: default_formats(),
        }
    }
}

/// Buffer sizes and timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSection {
    pub ring_size: usize,
    pub pending_capacity: usize,
    pub skip_capacity: usize,
    pub output_capacity: usize,
    /// Subframes before a missing TTI is skipped
    pub gap_timeout: u16,
    pub output_wait_ms: u64,
    /// Subframes before an idle UE is forgotten
    pub ue_inactivity: u16,
}

impl Default for PipelineSection {
    fn default() -> Self {
        let defaults = PipelineConfig::default();
        Self {
            ring_size: defaults.ring_size,
            pending_capacity: defaults.pending_capacity,
            skip_capacity: defaults.skip_capacity,
            output_capacity: defaults.output_capacity,
            gap_timeout: defaults.gap_timeout,
            output_wait_ms: defaults.output_wait.as_millis() as u64,
            ue_inactivity: defaults.ue_inactivity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDirection {
    Dl,
    Ul,
}

/// DCI log configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Directory for the per-cell log files; logging is off when absent
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_log_flags")]
    pub flags: Vec<LogDirection>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_log_flags() -> Vec<LogDirection> {
    vec![LogDirection::Dl, LogDirection::Ul]
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            flags: default_log_flags(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl LogConfig {
    pub fn log_flags(&self) -> LogFlags {
        self.flags.iter().fold(LogFlags::empty(), |flags, direction| {
            flags
                | match direction {
                    LogDirection::Dl => LogFlags::DOWNLINK,
                    LogDirection::Ul => LogFlags::UPLINK,
                }
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteSinkSection {
    pub bind_addr: SocketAddr,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Control channel elements available with CFI 3 for a bandwidth
pub fn default_cce_count(prb: u8) -> u32 {
    match prb {
        6 => 2,
        15 => 10,
        25 => 21,
        50 => 42,
        75 => 64,
        _ => 87,
    }
}

impl ScannerConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        let config: ScannerConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.radios.is_empty() || self.radios.len() > MAX_FRONT_ENDS {
            return Err(anyhow::anyhow!(
                "{} radios configured, expected 1 to {}",
                self.radios.len(),
                MAX_FRONT_ENDS
            ));
        }
        for (index, radio) in self.radios.iter().enumerate() {
            if Bandwidth::from_prb(radio.prb).is_none() {
                return Err(anyhow::anyhow!("Radio {}: invalid bandwidth of {} PRB", index, radio.prb));
            }
        }
        if self.decoder.workers_per_radio == 0 {
            return Err(anyhow::anyhow!("At least one decoder worker per radio is required"));
        }
        if self.decoder.formats.is_empty() {
            return Err(anyhow::anyhow!("No DCI formats to search"));
        }
        if (self.pipeline.gap_timeout as usize) > self.pipeline.ring_size {
            return Err(anyhow::anyhow!(
                "Gap timeout of {} subframes exceeds the ring size of {}",
                self.pipeline.gap_timeout,
                self.pipeline.ring_size
            ));
        }
        Ok(())
    }

    /// Resource blocks of each radio, in cell index order
    pub fn cell_prb(&self) -> Vec<u8> {
        self.radios.iter().map(|r| r.prb).collect()
    }

    /// Pipeline settings; `target_override` replaces the configured target
    pub fn pipeline_config(&self, target_override: Option<u16>) -> PipelineConfig {
        PipelineConfig {
            workers_per_radio: self.decoder.workers_per_radio,
            target: Rnti(target_override.unwrap_or(self.decoder.target_rnti)),
            formats: self.decoder.formats.clone(),
            ring_size: self.pipeline.ring_size,
            pending_capacity: self.pipeline.pending_capacity,
            skip_capacity: self.pipeline.skip_capacity,
            output_capacity: self.pipeline.output_capacity,
            gap_timeout: self.pipeline.gap_timeout,
            output_wait: Duration::from_millis(self.pipeline.output_wait_ms),
            ue_inactivity: self.pipeline.ue_inactivity,
        }
    }
}

//! Radio Front-end Sample Sources
//!
//! A source delivers one subframe (1 ms) of IQ samples per call. The decoder
//! pipeline owns one source per monitored cell.

use crate::InterfaceError;
use num_complex::Complex32;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One subframe of IQ samples
#[derive(Debug, Clone, Default)]
pub struct SubframeSamples {
    /// Complex baseband samples
    pub samples: Vec<Complex32>,
    /// Acquisition time, microseconds since the Unix epoch
    pub timestamp_us: u64,
    /// Subframes delivered by the source before this one
    pub sequence: u64,
}

/// Blocking producer of subframes
pub trait SubframeSource: Send {
    /// Wait for and return the next subframe
    fn acquire(&mut self) -> Result<SubframeSamples, InterfaceError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Wall-clock timestamp in microseconds
pub fn now_us() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

/// Decode little-endian interleaved cf32 bytes
pub fn cf32_from_bytes(bytes: &[u8]) -> Result<Vec<Complex32>, InterfaceError> {
    if bytes.len() % 8 != 0 {
        return Err(InterfaceError::InvalidMessage(format!(
            "{} bytes is not a whole number of cf32 samples",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            Complex32::new(
                f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            )
        })
        .collect())
}

/// Replays a raw cf32 capture one subframe at a time
pub struct FileSubframeSource {
    path: PathBuf,
    reader: BufReader<File>,
    sequence: u64,
    start_us: u64,
    buffer: Vec<u8>,
}

impl FileSubframeSource {
    /// Open a capture recorded at `samples_per_subframe` samples per millisecond
    pub fn open(path: impl AsRef<Path>, samples_per_subframe: usize) -> Result<Self, InterfaceError> {
        if samples_per_subframe == 0 {
            return Err(InterfaceError::InvalidConfig("samples per subframe must be positive".to_string()));
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| InterfaceError::InitializationFailed(format!("{}: {}", path.display(), e)))?;
        info!("Replaying IQ capture {} ({} samples/subframe)", path.display(), samples_per_subframe);

        Ok(Self {
            path,
            reader: BufReader::new(file),
            sequence: 0,
            start_us: now_us(),
            buffer: vec![0u8; samples_per_subframe * 8],
        })
    }
}

impl SubframeSource for FileSubframeSource {
    fn acquire(&mut self) -> Result<SubframeSamples, InterfaceError> {
        match self.reader.read_exact(&mut self.buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("End of capture {} after {} subframes", self.path.display(), self.sequence);
                return Err(InterfaceError::EndOfStream);
            }
            Err(e) => return Err(e.into()),
        }

        let samples = cf32_from_bytes(&self.buffer)?;
        let sequence = self.sequence;
        self.sequence += 1;

        Ok(SubframeSamples {
            samples,
            // Capture time is reconstructed from the sample clock
            timestamp_us: self.start_us + common::time::subframes_to_us(sequence),
            sequence,
        })
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Paced source producing empty subframes, used with the simulated PHY
pub struct SimulatedSource {
    period: Duration,
    next_deadline: Option<Instant>,
    sequence: u64,
    limit: Option<u64>,
    samples_per_subframe: usize,
}

impl SimulatedSource {
    /// Real-time source delivering one subframe per millisecond
    pub fn new(limit: Option<u64>) -> Self {
        Self::with_period(common::time::SUBFRAME_DURATION, limit)
    }

    /// Source with custom pacing; a zero period runs as fast as consumed
    pub fn with_period(period: Duration, limit: Option<u64>) -> Self {
        Self {
            period,
            next_deadline: None,
            sequence: 0,
            limit,
            samples_per_subframe: 0,
        }
    }

    /// Attach a zeroed sample buffer of this size to each subframe
    pub fn with_samples(mut self, samples_per_subframe: usize) -> Self {
        self.samples_per_subframe = samples_per_subframe;
        self
    }
}

impl SubframeSource for SimulatedSource {
    fn acquire(&mut self) -> Result<SubframeSamples, InterfaceError> {
        if let Some(limit) = self.limit {
            if self.sequence >= limit {
                debug!("Simulated source reached its limit of {} subframes", limit);
                return Err(InterfaceError::EndOfStream);
            }
        }

        if !self.period.is_zero() {
            let deadline = self.next_deadline.unwrap_or_else(Instant::now);
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.next_deadline = Some(deadline + self.period);
        }

        let sequence = self.sequence;
        self.sequence += 1;
        Ok(SubframeSamples {
            samples: vec![Complex32::new(0.0, 0.0); self.samples_per_subframe],
            timestamp_us: now_us(),
            sequence,
        })
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}

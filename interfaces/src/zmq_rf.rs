//! ZMQ RF Front-end for IQ Sample Reception
//!
//! This module implements a receive-only ZMQ front-end that pulls IQ samples
//! from srsRAN-compatible software radios and cuts them into subframes.

use crate::source::{cf32_from_bytes, now_us, SubframeSamples, SubframeSource};
use crate::InterfaceError;
use num_complex::Complex32;
use std::collections::VecDeque;
use tracing::{debug, info, trace, warn};
use zmq::{Context, Socket};

/// Default sample rate for a 20 MHz LTE cell (30.72 MHz)
pub const DEFAULT_SAMPLE_RATE: f64 = 30.72e6;

/// Default ZMQ RX port
pub const DEFAULT_RX_PORT: u16 = 2001;

/// ZMQ RF configuration
#[derive(Debug, Clone)]
pub struct ZmqRfConfig {
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// RX connection address
    pub rx_address: String,
    /// Receive timeout in milliseconds
    pub rx_timeout_ms: i32,
    /// Receive gain in dB
    pub rx_gain: f32,
}

impl Default for ZmqRfConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            rx_address: format!("tcp://localhost:{}", DEFAULT_RX_PORT),
            rx_timeout_ms: 100,
            rx_gain: 0.0,
        }
    }
}

impl ZmqRfConfig {
    /// Parse device arguments in srsRAN format
    /// Format: "key1=value1,key2=value2,..."
    /// Indexed port names (rx_port0, rx_port1, ...) select the first channel only.
    pub fn from_device_args(args: &str) -> Result<Self, InterfaceError> {
        let mut config = Self::default();

        for pair in args.split(',') {
            let parts: Vec<&str> = pair.trim().split('=').collect();
            if parts.len() != 2 {
                continue;
            }

            let key = parts[0].trim();
            let value = parts[1].trim();

            match key {
                "base_srate" => {
                    config.sample_rate = value.parse::<f64>()
                        .map_err(|_| InterfaceError::InvalidConfig("Invalid base_srate".to_string()))?;
                }
                "rx_gain" => {
                    config.rx_gain = value.parse::<f32>()
                        .map_err(|_| InterfaceError::InvalidConfig("Invalid rx_gain".to_string()))?;
                }
                "rx_timeout_ms" => {
                    config.rx_timeout_ms = value.parse::<i32>()
                        .map_err(|_| InterfaceError::InvalidConfig("Invalid rx_timeout_ms".to_string()))?;
                }
                "rx_port" | "rx_port0" => {
                    config.rx_address = value.to_string();
                }
                _ => {
                    trace!("Ignoring device argument {}", key);
                }
            }
        }

        Ok(config)
    }

    /// Samples in one 1 ms subframe at the configured rate
    pub fn samples_per_subframe(&self) -> usize {
        (self.sample_rate / 1000.0).round() as usize
    }
}

/// RX statistics
#[derive(Debug, Default, Clone)]
pub struct RfStats {
    pub rx_samples: u64,
    pub rx_subframes: u64,
    pub rx_timeouts: u64,
}

/// ZMQ front-end delivering whole subframes
pub struct ZmqSubframeSource {
    config: ZmqRfConfig,
    _context: Context,
    rx_socket: Socket,
    pending: VecDeque<Complex32>,
    samples_per_subframe: usize,
    sequence: u64,
    stats: RfStats,
}

impl ZmqSubframeSource {
    /// Connect the RX socket
    pub fn connect(config: ZmqRfConfig) -> Result<Self, InterfaceError> {
        let samples_per_subframe = config.samples_per_subframe();
        if samples_per_subframe == 0 {
            return Err(InterfaceError::InvalidConfig(format!(
                "sample rate {} gives empty subframes",
                config.sample_rate
            )));
        }

        info!("Initializing ZMQ RF front-end");
        info!("Sample rate: {} MHz", config.sample_rate / 1e6);

        // RX uses a REQ socket and connects (sends requests to the radio)
        let context = Context::new();
        let rx_socket = context.socket(zmq::REQ)?;
        rx_socket.connect(&config.rx_address)?;
        rx_socket.set_rcvtimeo(config.rx_timeout_ms)?;
        rx_socket.set_sndtimeo(config.rx_timeout_ms)?;
        // Allow a new request after a timed-out reply
        rx_socket.set_req_relaxed(true)?;
        info!("RX socket connected to {} (REQ mode)", config.rx_address);

        Ok(Self {
            config,
            _context: context,
            rx_socket,
            pending: VecDeque::with_capacity(samples_per_subframe * 2),
            samples_per_subframe,
            sequence: 0,
            stats: RfStats::default(),
        })
    }

    /// Get RF statistics
    pub fn stats(&self) -> RfStats {
        self.stats.clone()
    }

    /// Request one block of samples from the radio
    fn request_block(&mut self) -> Result<(), InterfaceError> {
        // Dummy request byte, as srsRAN expects
        self.rx_socket.send(&[0xFFu8][..], 0)?;

        match self.rx_socket.recv_bytes(0) {
            Ok(bytes) => {
                let samples = cf32_from_bytes(&bytes)?;
                trace!("RX: received {} samples", samples.len());
                self.stats.rx_samples += samples.len() as u64;
                self.pending.extend(samples);
                Ok(())
            }
            Err(zmq::Error::EAGAIN) => {
                self.stats.rx_timeouts += 1;
                if self.stats.rx_timeouts % 100 == 1 {
                    warn!("RX: no samples from {} ({} timeouts)", self.config.rx_address, self.stats.rx_timeouts);
                }
                Err(InterfaceError::Timeout)
            }
            Err(e) => Err(InterfaceError::ZmqError(e)),
        }
    }
}

impl SubframeSource for ZmqSubframeSource {
    fn acquire(&mut self) -> Result<SubframeSamples, InterfaceError> {
        while self.pending.len() < self.samples_per_subframe {
            self.request_block()?;
        }

        let samples: Vec<Complex32> = self.pending.drain(..self.samples_per_subframe).collect();
        let sequence = self.sequence;
        self.sequence += 1;
        self.stats.rx_subframes += 1;
        if sequence % 10_000 == 0 {
            debug!("RX: {} subframes, {} samples", self.stats.rx_subframes, self.stats.rx_samples);
        }

        Ok(SubframeSamples {
            samples,
            timestamp_us: now_us(),
            sequence,
        })
    }

    fn describe(&self) -> String {
        format!("zmq:{}", self.config.rx_address)
    }
}

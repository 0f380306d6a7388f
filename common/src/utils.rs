//! Common Utilities
//!
//! Provides bit-level helpers used by the DCI payload handling and the
//! exporters

use tracing::trace;

/// CRC-16 (gCRC16, 36.212 5.1.1) over an unpacked bit sequence
pub fn crc16_bits(bits: &[u8]) -> u16 {
    const CRC16_POLY: u16 = 0x1021;
    let mut crc: u16 = 0;

    for &bit in bits {
        let feedback = ((crc >> 15) as u8 ^ (bit & 1)) != 0;
        crc <<= 1;
        if feedback {
            crc ^= CRC16_POLY;
        }
    }

    crc
}

/// Append the `num_bits` least significant bits of `value`, MSB first
pub fn append_bits(bits: &mut Vec<u8>, value: u32, num_bits: u8) {
    for i in (0..num_bits).rev() {
        bits.push(((value >> i) & 1) as u8);
    }
}

/// Read `num_bits` bits starting at `offset`, MSB first
///
/// Returns `None` when the sequence is too short.
pub fn read_bits(bits: &[u8], offset: usize, num_bits: u8) -> Option<u32> {
    let end = offset + num_bits as usize;
    if end > bits.len() {
        trace!("Bit read past end: offset={}, len={}, avail={}", offset, num_bits, bits.len());
        return None;
    }

    Some(bits[offset..end]
        .iter()
        .fold(0u32, |acc, &b| (acc << 1) | (b & 1) as u32))
}

/// Time utilities for subframe pacing
pub mod time {
    use std::time::Duration;

    /// One LTE subframe
    pub const SUBFRAME_DURATION: Duration = Duration::from_millis(1);

    /// Microseconds covered by `n` subframes
    pub fn subframes_to_us(n: u64) -> u64 {
        n * 1000
    }
}

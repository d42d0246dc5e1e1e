//! PCR samples and the PCR-based bit-rate estimator

use serde::Serialize;

use crate::constants::{PCR_BASE_MODULUS, PCR_EXT_PER_BASE};

/// Raw 42-bit program clock reference: 33-bit 90 kHz base + 9-bit extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pcr {
    pub base: u64,
    pub extension: u16,
}

impl Pcr {
    /// Decode the 6-byte PCR/OPCR field of an adaptation field.
    pub fn from_bytes(p: &[u8]) -> Self {
        let base = ((p[0] as u64) << 25)
            | ((p[1] as u64) << 17)
            | ((p[2] as u64) << 9)
            | ((p[3] as u64) << 1)
            | ((p[4] as u64) >> 7);
        let extension = (((p[4] & 0x01) as u16) << 8) | (p[5] as u16);
        Self { base, extension }
    }

    /// Value in 27 MHz ticks.
    pub fn ticks(&self) -> u64 {
        self.base * PCR_EXT_PER_BASE + self.extension as u64
    }
}

/// A PCR placed on the session's unwrapped timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockSample {
    pub pcr: Pcr,
    /// `pcr.base` plus every 2^33 wrap seen since the window opened
    pub unwrapped_base: u64,
    /// Session-wide index of the packet carrying this sample
    pub packet_index: u64,
}

impl ClockSample {
    pub fn ticks(&self) -> u64 {
        self.unwrapped_base * PCR_EXT_PER_BASE + self.pcr.extension as u64
    }
}

/// Per-channel PCR window and running bit-rate estimate.
///
/// The estimate always spans the whole window, from the first sample after
/// the last discontinuity to the latest sample.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClockReference {
    pub first: Option<ClockSample>,
    pub last: Option<ClockSample>,
    pub bitrate: Option<u64>,
    pub samples: u64,
    pub wraps: u64,
    #[serde(skip)]
    wrap_offset: u64,
}

impl ClockReference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample; returns the refreshed bit-rate estimate in bits/s.
    ///
    /// Assumes at most one 2^33 wrap between consecutive samples.
    pub fn update(
        &mut self,
        pcr: Pcr,
        packet_index: u64,
        discontinuity: bool,
        packet_size: usize,
        clock_hz: u64,
    ) -> Option<u64> {
        self.samples += 1;

        let prev = match self.last {
            Some(prev) if !discontinuity => prev,
            _ => {
                self.restart(pcr, packet_index);
                return None;
            }
        };

        if pcr.base < prev.pcr.base {
            self.wrap_offset += PCR_BASE_MODULUS;
            self.wraps += 1;
            tracing::trace!(base = pcr.base, prev = prev.pcr.base, "PCR wrapped");
        }
        let sample = ClockSample {
            pcr,
            unwrapped_base: pcr.base + self.wrap_offset,
            packet_index,
        };
        self.last = Some(sample);

        let first = self.first.unwrap_or(sample);
        self.bitrate = bitrate(&first, &sample, packet_size, clock_hz);
        self.bitrate
    }

    /// Elapsed wall time of the current window in seconds.
    pub fn window_seconds(&self, clock_hz: u64) -> Option<f64> {
        let (first, last) = (self.first?, self.last?);
        Some(last.ticks().saturating_sub(first.ticks()) as f64 / clock_hz as f64)
    }

    fn restart(&mut self, pcr: Pcr, packet_index: u64) {
        self.wrap_offset = 0;
        let sample = ClockSample {
            pcr,
            unwrapped_base: pcr.base,
            packet_index,
        };
        self.first = Some(sample);
        self.last = Some(sample);
        self.bitrate = None;
    }
}

/// `packets * packet_size * clock_hz * 8 / (last - first)`, in exact integer arithmetic.
pub fn bitrate(first: &ClockSample, last: &ClockSample, packet_size: usize, clock_hz: u64) -> Option<u64> {
    let ticks = last.ticks().checked_sub(first.ticks())?;
    let packets = last.packet_index.checked_sub(first.packet_index)?;
    if ticks == 0 || packets == 0 {
        return None;
    }
    let bits = packets as u128 * packet_size as u128 * clock_hz as u128 * 8;
    u64::try_from(bits / ticks as u128).ok()
}

use serde::{Deserialize, Serialize};

/// Raw PCM sample layout used for call recording.
///
/// Samples are always signed 16-bit little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const BIT_DEPTH: u16 = 16;

    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// Samples (across all channels) in `millis` milliseconds.
    pub fn samples_for_millis(&self, millis: u64) -> usize {
        (self.sample_rate as u64 * self.channels as u64 * millis / 1000) as usize
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (Self::BIT_DEPTH as u64 / 8)
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::mono(8000)
    }
}

/// Counters collected while a capture runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureDiagnostics {
    pub reads: u64,
    pub samples_captured: u64,
    pub samples_dropped: u64,
    pub read_errors: u64,
}

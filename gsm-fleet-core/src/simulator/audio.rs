use std::f32::consts::TAU;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::models::audio::PcmFormat;
use crate::models::error::RecordingError;
use crate::traits::audio_input::{AudioBackend, AudioInput, PcmStream};

/// Tone-generating capture backend.
///
/// Every device name binds except those listed as missing.
#[derive(Debug, Clone, Default)]
pub struct SimulatedAudio {
    missing: Vec<String>,
    frequency: Option<f32>,
}

impl SimulatedAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_missing_device(mut self, device: &str) -> Self {
        self.missing.push(device.to_string());
        self
    }

    pub fn with_frequency(mut self, frequency: f32) -> Self {
        self.frequency = Some(frequency);
        self
    }
}

impl AudioBackend for SimulatedAudio {
    fn bind(&self, device: &str) -> Result<Arc<dyn AudioInput>, RecordingError> {
        if self.missing.iter().any(|d| d == device) {
            return Err(RecordingError::DeviceUnavailable);
        }
        Ok(Arc::new(ToneInput {
            device: device.to_string(),
            frequency: self.frequency.unwrap_or(440.0),
        }))
    }
}

struct ToneInput {
    device: String,
    frequency: f32,
}

impl AudioInput for ToneInput {
    fn device_id(&self) -> &str {
        &self.device
    }

    fn open(&self, format: PcmFormat) -> Result<Box<dyn PcmStream>, RecordingError> {
        Ok(Box::new(ToneStream {
            format,
            frequency: self.frequency,
            phase: 0.0,
        }))
    }
}

/// Produces samples in real time, sleeping for the duration of each read.
struct ToneStream {
    format: PcmFormat,
    frequency: f32,
    phase: f32,
}

impl PcmStream for ToneStream {
    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize, RecordingError> {
        let channels = self.format.channels.max(1) as usize;
        let frames = buf.len() / channels;
        let step = TAU * self.frequency / self.format.sample_rate as f32;

        for frame in buf.chunks_exact_mut(channels) {
            let sample = (self.phase.sin() * 0.3 * i16::MAX as f32) as i16;
            frame.fill(sample);
            self.phase = (self.phase + step) % TAU;
        }

        let micros = frames as u64 * 1_000_000 / self.format.sample_rate.max(1) as u64;
        thread::sleep(Duration::from_micros(micros));
        Ok(frames * channels)
    }
}

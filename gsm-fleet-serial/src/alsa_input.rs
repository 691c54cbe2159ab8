//! ALSA capture through `arecord`.
//!
//! Each module's audio output is wired to a USB sound card. A stream spawns
//! `arecord` writing raw little-endian 16-bit PCM to a pipe and converts the
//! bytes to samples.

use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;

use gsm_fleet_core::models::audio::PcmFormat;
use gsm_fleet_core::models::error::RecordingError;
use gsm_fleet_core::traits::audio_input::{AudioBackend, AudioInput, PcmStream};

/// Resolves ALSA device names (`hw:1,0`, `plughw:CARD=Device,DEV=0`).
#[derive(Debug, Clone)]
pub struct AlsaBackend {
    program: String,
}

impl AlsaBackend {
    pub fn new() -> Self {
        Self {
            program: "arecord".into(),
        }
    }

    /// Use a different capture program with `arecord`-compatible flags.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for AlsaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for AlsaBackend {
    fn bind(&self, device: &str) -> Result<Arc<dyn AudioInput>, RecordingError> {
        let device = device.trim();
        if device.is_empty() || device.contains(char::is_whitespace) {
            return Err(RecordingError::DeviceUnavailable);
        }
        Ok(Arc::new(AlsaInput {
            program: self.program.clone(),
            device: device.to_string(),
        }))
    }
}

pub struct AlsaInput {
    program: String,
    device: String,
}

impl AlsaInput {
    fn command(&self, format: PcmFormat) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["-q", "-f", "S16_LE", "-t", "raw"])
            .arg("-D")
            .arg(&self.device)
            .arg("-r")
            .arg(format.sample_rate.to_string())
            .arg("-c")
            .arg(format.channels.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        command
    }
}

impl AudioInput for AlsaInput {
    fn device_id(&self) -> &str {
        &self.device
    }

    fn open(&self, format: PcmFormat) -> Result<Box<dyn PcmStream>, RecordingError> {
        let mut child = self.command(format).spawn().map_err(|e| {
            log::warn!("failed to start {} on {}: {}", self.program, self.device, e);
            RecordingError::DeviceUnavailable
        })?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RecordingError::DeviceUnavailable);
        };
        log::debug!("{}: capture started ({} Hz, {} ch)", self.device, format.sample_rate, format.channels);
        Ok(Box::new(AlsaStream {
            child,
            stdout,
            bytes: Vec::new(),
            pending: None,
        }))
    }
}

struct AlsaStream {
    child: Child,
    stdout: ChildStdout,
    bytes: Vec<u8>,
    /// Low byte of a sample split across two reads.
    pending: Option<u8>,
}

impl PcmStream for AlsaStream {
    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize, RecordingError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let capacity = buf.len() * 2 - usize::from(self.pending.is_some());
        self.bytes.resize(capacity, 0);
        let read = loop {
            match self.stdout.read(&mut self.bytes) {
                Ok(0) => return Err(RecordingError::ReadFailed("capture process exited".into())),
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(RecordingError::ReadFailed(e.to_string())),
            }
        };
        Ok(decode_samples(&mut self.pending, &self.bytes[..read], buf))
    }
}

impl Drop for AlsaStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Convert little-endian bytes to samples, carrying an odd trailing byte
/// into the next call. Returns the number of samples written.
fn decode_samples(pending: &mut Option<u8>, bytes: &[u8], out: &mut [i16]) -> usize {
    let mut written = 0;
    let mut iter = bytes.iter().copied();
    if let Some(low) = pending.take() {
        match iter.next() {
            Some(high) => {
                out[0] = i16::from_le_bytes([low, high]);
                written = 1;
            }
            None => {
                *pending = Some(low);
                return 0;
            }
        }
    }
    while written < out.len() {
        match (iter.next(), iter.next()) {
            (Some(low), Some(high)) => {
                out[written] = i16::from_le_bytes([low, high]);
                written += 1;
            }
            (Some(low), None) => {
                *pending = Some(low);
                break;
            }
            _ => break,
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_samples() {
        let mut pending = None;
        let mut out = [0i16; 4];
        let n = decode_samples(&mut pending, &[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80], &mut out);
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[1, -1, i16::MIN]);
        assert!(pending.is_none());
    }

    #[test]
    fn carries_odd_byte_to_next_read() {
        let mut pending = None;
        let mut out = [0i16; 4];
        assert_eq!(decode_samples(&mut pending, &[0x34, 0x12, 0x78], &mut out), 1);
        assert_eq!(out[0], 0x1234);
        assert_eq!(pending, Some(0x78));

        assert_eq!(decode_samples(&mut pending, &[0x56], &mut out), 1);
        assert_eq!(out[0], 0x5678);
        assert!(pending.is_none());
    }

    #[test]
    fn rejects_malformed_device_names() {
        let backend = AlsaBackend::new();
        assert!(backend.bind("").is_err());
        assert!(backend.bind("hw:1,0; rm").is_err());
        assert_eq!(backend.bind("hw:1,0").unwrap().device_id(), "hw:1,0");
    }

    #[test]
    fn missing_program_is_device_unavailable() {
        let backend = AlsaBackend::with_program("/nonexistent/gsm-fleet-arecord");
        let input = backend.bind("hw:1,0").unwrap();
        assert!(matches!(
            input.open(PcmFormat::mono(8000)),
            Err(RecordingError::DeviceUnavailable)
        ));
    }
}

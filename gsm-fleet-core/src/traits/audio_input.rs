use std::sync::Arc;

use crate::models::audio::PcmFormat;
use crate::models::error::RecordingError;

/// An open PCM capture stream.
pub trait PcmStream: Send {
    /// Read up to `buf.len()` interleaved samples.
    ///
    /// Must return within roughly one frame duration; `Ok(0)` means no data
    /// arrived in that window.
    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize, RecordingError>;
}

/// A capture device paired with one module's audio output.
pub trait AudioInput: Send + Sync {
    fn device_id(&self) -> &str;

    fn open(&self, format: PcmFormat) -> Result<Box<dyn PcmStream>, RecordingError>;
}

/// Resolves configured device names to capture devices.
///
/// Implemented by:
/// - `AlsaBackend` (gsm-fleet-serial, Linux `arecord`)
/// - `SimulatedAudio` (tone generator)
pub trait AudioBackend: Send + Sync {
    fn bind(&self, device: &str) -> Result<Arc<dyn AudioInput>, RecordingError>;
}

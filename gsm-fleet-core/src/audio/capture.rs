use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::audio::{CaptureDiagnostics, PcmFormat};
use crate::models::call::CallId;
use crate::models::config::RecordingSettings;
use crate::models::error::RecordingError;
use crate::models::module::ModuleId;
use crate::models::recording_result::{RecordingMetadata, RecordingResult};
use crate::storage::metadata::write_metadata;
use crate::storage::wav_writer::WavFileWriter;
use crate::traits::audio_input::AudioInput;
use crate::traits::encryptor::RecordingEncryptor;

/// Samples per encrypted chunk when writing the file (one second at 8 kHz mono).
const WRITE_CHUNK_SAMPLES: usize = 8000;

/// Records one active call.
///
/// Created when the call enters `Active` and consumed by [`stop`](Self::stop)
/// when it leaves. The capture thread checks its running flag before every
/// read, so a stop takes effect within one read.
///
/// ```text
/// [PcmStream] → capture thread → Vec<i16> (bounded) → stop() → WavFileWriter → call_<id>.wav
///                                                               └→ call_<id>.metadata.json
/// ```
pub struct AudioCaptureService {
    call_id: CallId,
    module_id: ModuleId,
    format: PcmFormat,
    output_directory: PathBuf,
    encryptor: Option<Box<dyn RecordingEncryptor>>,
    running: Arc<AtomicBool>,
    diagnostics: Arc<Mutex<CaptureDiagnostics>>,
    handle: Option<thread::JoinHandle<Vec<i16>>>,
    started: Instant,
}

impl AudioCaptureService {
    /// Open the input and start capturing on a dedicated thread.
    pub fn start(
        call_id: &CallId,
        module_id: &ModuleId,
        input: &dyn AudioInput,
        settings: &RecordingSettings,
        encryptor: Option<Box<dyn RecordingEncryptor>>,
    ) -> Result<Self, RecordingError> {
        let format = settings.format();
        let mut stream = input.open(format)?;

        let frame_samples = format.samples_for_millis(settings.frame_millis).max(1);
        let capacity = format.samples_for_millis(settings.max_duration_secs.saturating_mul(1000));
        let frame_duration = Duration::from_millis(settings.frame_millis);
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(Mutex::new(CaptureDiagnostics::default()));

        let thread_running = Arc::clone(&running);
        let thread_diagnostics = Arc::clone(&diagnostics);
        let thread_call = call_id.clone();
        let handle = thread::Builder::new()
            .name(format!("capture-{}", call_id))
            .spawn(move || {
                let mut samples: Vec<i16> = Vec::with_capacity(capacity.min(frame_samples * 50 * 60));
                let mut frame = vec![0i16; frame_samples];

                while thread_running.load(Ordering::SeqCst) {
                    match stream.read_samples(&mut frame) {
                        Ok(0) => {}
                        Ok(read) => {
                            let read = read.min(frame.len());
                            let room = capacity.saturating_sub(samples.len());
                            let kept = read.min(room);
                            samples.extend_from_slice(&frame[..kept]);

                            let mut diag = thread_diagnostics.lock();
                            diag.reads += 1;
                            diag.samples_captured += kept as u64;
                            diag.samples_dropped += (read - kept) as u64;
                        }
                        Err(e) => {
                            let errors = {
                                let mut diag = thread_diagnostics.lock();
                                diag.read_errors += 1;
                                diag.read_errors
                            };
                            if errors == 1 || errors % 100 == 0 {
                                log::warn!("{}: audio read failed ({} so far): {}", thread_call, errors, e);
                            }
                            thread::sleep(frame_duration);
                        }
                    }
                }
                samples
            })
            .map_err(|e| RecordingError::Worker(e.to_string()))?;

        log::info!("{}: recording started on {}", call_id, input.device_id());
        Ok(Self {
            call_id: call_id.clone(),
            module_id: module_id.clone(),
            format,
            output_directory: settings.output_directory.clone(),
            encryptor,
            running,
            diagnostics,
            handle: Some(handle),
            started: Instant::now(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn diagnostics(&self) -> CaptureDiagnostics {
        self.diagnostics.lock().clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Signal the capture thread, wait for it, and write the recording.
    pub fn stop(mut self) -> Result<RecordingResult, RecordingError> {
        self.running.store(false, Ordering::SeqCst);
        let samples = self
            .handle
            .take()
            .ok_or_else(|| RecordingError::Worker("capture already stopped".into()))?
            .join()
            .map_err(|_| RecordingError::Worker("capture thread panicked".into()))?;
        self.finalize(samples)
    }

    fn finalize(&self, samples: Vec<i16>) -> Result<RecordingResult, RecordingError> {
        let extension = if self.encryptor.is_some() { "enc.wav" } else { "wav" };
        let path = self
            .output_directory
            .join(format!("{}.{}", self.call_id, extension));

        let mut writer = WavFileWriter::create(path.clone(), self.format, self.encryptor.clone())?;
        let chunk = WRITE_CHUNK_SAMPLES * self.format.channels.max(1) as usize;
        for block in samples.chunks(chunk) {
            writer.write_samples(block)?;
        }
        let checksum = writer.finish()?;

        let samples_per_second = self.format.sample_rate as f64 * self.format.channels.max(1) as f64;
        let duration_secs = samples.len() as f64 / samples_per_second;
        let diagnostics = self.diagnostics();
        let metadata = RecordingMetadata::new(
            self.call_id.as_str(),
            self.module_id.as_str(),
            duration_secs,
            &path.to_string_lossy(),
            &checksum,
            self.format,
            diagnostics.samples_dropped,
            self.encryptor.as_ref().map(|e| e.algorithm().to_string()),
            self.encryptor.as_ref().map(|e| e.key_id()),
        );
        write_metadata(&metadata, &path)?;

        if diagnostics.samples_dropped > 0 {
            log::warn!(
                "{}: recording truncated, {} samples dropped",
                self.call_id,
                diagnostics.samples_dropped
            );
        }
        log::info!(
            "{}: recording saved to {} ({:.1}s)",
            self.call_id,
            path.display(),
            duration_secs
        );

        Ok(RecordingResult {
            file_path: path,
            duration_secs,
            metadata,
            checksum,
        })
    }
}

impl Drop for AudioCaptureService {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav_format;
    use crate::simulator::SimulatedAudio;
    use crate::storage::metadata::read_metadata;
    use crate::traits::audio_input::{AudioBackend, PcmStream};
    use std::fs;

    fn settings(dir: &str) -> RecordingSettings {
        RecordingSettings {
            output_directory: std::env::temp_dir().join(format!("gsm_fleet_{}_{}", dir, std::process::id())),
            frame_millis: 10,
            ..Default::default()
        }
    }

    #[test]
    fn records_until_stopped() {
        let settings = settings("capture_basic");
        let input = SimulatedAudio::new().bind("hw:1,0").unwrap();
        let call = CallId::from("call_test1");

        let capture =
            AudioCaptureService::start(&call, &ModuleId::from("m1"), input.as_ref(), &settings, None).unwrap();
        thread::sleep(Duration::from_millis(200));
        let result = capture.stop().unwrap();

        assert!(result.file_path.ends_with("call_test1.wav"));
        assert!(result.duration_secs > 0.05 && result.duration_secs < 1.0);

        let bytes = fs::read(&result.file_path).unwrap();
        let info = wav_format::parse_header(&bytes).unwrap();
        assert_eq!(info.format, PcmFormat::mono(8000));
        assert_eq!(info.data_size as usize, bytes.len() - wav_format::WAV_HEADER_SIZE);

        let metadata = read_metadata(&result.file_path).unwrap();
        assert_eq!(metadata.call_id, "call_test1");
        assert_eq!(metadata.checksum, result.checksum);

        fs::remove_dir_all(&settings.output_directory).ok();
    }

    /// Blocks each read for a long time unless told to stop.
    struct SlowStream {
        reads: Arc<Mutex<u32>>,
    }

    impl PcmStream for SlowStream {
        fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize, RecordingError> {
            *self.reads.lock() += 1;
            thread::sleep(Duration::from_millis(20));
            buf.fill(1);
            Ok(buf.len())
        }
    }

    struct SlowInput {
        reads: Arc<Mutex<u32>>,
    }

    impl AudioInput for SlowInput {
        fn device_id(&self) -> &str {
            "slow"
        }

        fn open(&self, _format: PcmFormat) -> Result<Box<dyn PcmStream>, RecordingError> {
            Ok(Box::new(SlowStream {
                reads: Arc::clone(&self.reads),
            }))
        }
    }

    #[test]
    fn stop_takes_effect_within_one_read() {
        let settings = settings("capture_stop");
        let reads = Arc::new(Mutex::new(0));
        let input = SlowInput {
            reads: Arc::clone(&reads),
        };

        let capture =
            AudioCaptureService::start(&CallId::from("call_stop"), &ModuleId::from("m1"), &input, &settings, None)
                .unwrap();
        thread::sleep(Duration::from_millis(70));
        let started = Instant::now();
        let reads_at_stop = *reads.lock();
        capture.stop().unwrap();

        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(*reads.lock() <= reads_at_stop + 1);

        fs::remove_dir_all(&settings.output_directory).ok();
    }

    #[test]
    fn buffer_is_bounded_and_drops_are_counted() {
        let mut settings = settings("capture_bounded");
        settings.max_duration_secs = 0;
        let input = SimulatedAudio::new().bind("hw:1,0").unwrap();

        let capture = AudioCaptureService::start(
            &CallId::from("call_bounded"),
            &ModuleId::from("m1"),
            input.as_ref(),
            &settings,
            None,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        let result = capture.stop().unwrap();

        assert_eq!(result.duration_secs, 0.0);
        assert!(result.metadata.samples_dropped > 0);

        fs::remove_dir_all(&settings.output_directory).ok();
    }

    #[test]
    fn encrypted_recording_uses_enc_extension() {
        let settings = settings("capture_enc");
        let input = SimulatedAudio::new().bind("hw:1,0").unwrap();
        let encryptor = crate::storage::cipher::Aes256GcmEncryptor::new(&[7u8; 32]);

        let capture = AudioCaptureService::start(
            &CallId::from("call_enc"),
            &ModuleId::from("m1"),
            input.as_ref(),
            &settings,
            Some(Box::new(encryptor)),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        let result = capture.stop().unwrap();

        assert!(result.file_path.ends_with("call_enc.enc.wav"));
        assert!(result.metadata.is_encrypted);
        assert_eq!(result.metadata.encryption_algorithm.as_deref(), Some("AES-256-GCM"));

        fs::remove_dir_all(&settings.output_directory).ok();
    }
}

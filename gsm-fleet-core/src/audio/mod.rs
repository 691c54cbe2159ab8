pub mod capture;
pub mod wav_format;

pub use capture::AudioCaptureService;

//! # gsm-fleet-core
//!
//! Platform-agnostic core for a fleet of SIM800C GSM modules.
//!
//! Provides the AT line protocol, per-module command channels, the module
//! registry with health polling, the call state machine with call recording,
//! SMS sending and OTP verification. Hardware backends (serial ports, ALSA
//! capture devices) implement the `PortOpener` and `AudioBackend` traits and
//! plug into the generic `Fleet`.
//!
//! ## Architecture
//!
//! ```text
//! gsm-fleet-core (this crate)
//! ├── traits/        ← PortOpener, AudioBackend, RecordingEncryptor, CallObserver, SmsProvider, CallProvider, Clock
//! ├── models/        ← errors, Module, CallRecord, VerificationRecord, FleetConfig, RecordingResult
//! ├── protocol/      ← line assembly, line classification, CSQ/CBC/COPS/CMGS parsers
//! ├── channel/       ← AtChannel (one reader thread per module)
//! ├── registry/      ← ModuleRegistry (reconnects), HealthMonitor
//! ├── call/          ← CallController (one supervisor thread per call)
//! ├── audio/         ← AudioCaptureService, WAV header generation
//! ├── storage/       ← WavFileWriter, AES-256-GCM encryptor, metadata
//! ├── sms/           ← SmsDispatcher
//! ├── verification/  ← SmsVerificationService, RateLimiter
//! ├── provider       ← Fleet, DevelopmentProvider, Provider
//! ├── gateway        ← boundary API with serializable responses
//! └── simulator/     ← in-process SIM800C and audio stand-ins
//! ```

pub mod audio;
pub mod call;
pub mod channel;
pub mod gateway;
pub mod models;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod simulator;
pub mod sms;
pub mod storage;
pub mod traits;
pub mod verification;

// Re-export key types at crate root for convenience.
pub use audio::AudioCaptureService;
pub use call::CallController;
pub use channel::{AtChannel, ChannelFault, ResponseLines};
pub use gateway::Gateway;
pub use models::call::{CallDirection, CallId, CallRecord, CallSummary};
pub use models::config::{FleetConfig, ProviderKind};
pub use models::error::{CallError, ChannelError, ConfigError, InitError, RecordingError, SmsError, VerifyError};
pub use models::module::{Module, ModuleConfig, ModuleId, ModuleStatus, ModuleSummary};
pub use models::recording_result::{RecordingMetadata, RecordingResult};
pub use models::sms::ReceivedSms;
pub use models::state::{CallStatus, TerminationReason};
pub use protocol::Notification;
pub use provider::{DevelopmentProvider, Fleet, Hardware, Provider};
pub use registry::{HealthMonitor, ModuleRegistry, SelectionCriteria};
pub use sms::SmsDispatcher;
pub use storage::cipher::Aes256GcmEncryptor;
pub use storage::wav_writer::WavFileWriter;
pub use traits::audio_input::{AudioBackend, AudioInput, PcmStream};
pub use traits::call_observer::CallObserver;
pub use traits::encryptor::RecordingEncryptor;
pub use traits::port::{PortHandles, PortOpener};
pub use traits::provider::{CallProvider, SmsProvider, SmsReceipt};
pub use verification::SmsVerificationService;

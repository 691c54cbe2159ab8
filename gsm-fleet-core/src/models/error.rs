use std::time::Duration;

use thiserror::Error;

/// Errors produced by a single AT command channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No terminal token arrived before the deadline.
    #[error("command timed out")]
    Timeout,

    /// Serial open/reopen or write failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The modem answered `ERROR`, `+CME ERROR` or `+CMS ERROR`.
    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("channel is not connected")]
    NotConnected,
}

/// Errors raised while registering a module.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("module {0} is already registered")]
    DuplicateModule(String),

    #[error("invalid module configuration: {0}")]
    InvalidConfig(String),

    #[error("registry is shut down")]
    ShutDown,

    #[error("failed to start worker: {0}")]
    Worker(String),
}

/// Errors from the call controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("module {0} is not available")]
    ModuleUnavailable(String),

    #[error("module {0} already has an active call")]
    ModuleBusy(String),

    #[error("module {0} has no incoming call")]
    NoIncomingCall(String),

    #[error("invalid phone number: {0}")]
    InvalidNumber(String),

    #[error("unknown call: {0}")]
    UnknownCall(String),

    #[error("dial rejected: {0}")]
    DialFailed(String),

    #[error("answer rejected: {0}")]
    AnswerFailed(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("failed to start call supervisor: {0}")]
    Worker(String),
}

/// Errors from the SMS send protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SmsError {
    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("module {0} is not available")]
    ModuleUnavailable(String),

    #[error("no connected module available")]
    NoModuleAvailable,

    #[error("invalid phone number: {0}")]
    InvalidNumber(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("modem did not present the '>' prompt")]
    MissingPrompt,

    #[error("modem rejected the message: {0}")]
    Rejected(String),

    #[error("timed out waiting for +CMGS")]
    Timeout,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors from call recording.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordingError {
    /// No audio device is bound, or it could not be opened.
    #[error("audio device not available")]
    DeviceUnavailable,

    #[error("audio read failed: {0}")]
    ReadFailed(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("recording thread failed: {0}")]
    Worker(String),
}

/// Errors from the OTP verification layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("too many verification requests, retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("verification code expired")]
    CodeExpired,

    #[error("maximum verification attempts exceeded")]
    MaxAttemptsExceeded,

    #[error("invalid code, {remaining_attempts} attempts remaining")]
    Mismatch { remaining_attempts: u32 },

    #[error("code already verified")]
    AlreadyVerified,

    #[error("no verification code found")]
    NotFound,

    #[error("invalid phone number: {0}")]
    InvalidNumber(String),

    #[error("failed to deliver verification code: {0}")]
    Delivery(#[from] SmsError),
}

/// Errors loading or validating a fleet configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::audio::PcmFormat;
use super::error::ConfigError;
use super::module::ModuleConfig;

/// Which backend serves calls and SMS. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Sim800c,
    Development,
}

/// Top-level configuration, loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub provider: ProviderKind,

    /// Use the in-process modem simulator instead of serial ports.
    pub simulate: bool,

    pub modules: Vec<ModuleConfig>,
    pub channel: ChannelSettings,
    pub health: HealthSettings,
    pub calls: CallSettings,
    pub sms: SmsSettings,
    pub recording: RecordingSettings,
    pub verification: VerificationSettings,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = serde_json::from_str(json)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        for module in &self.modules {
            module.validate()?;
        }
        let mut ids: Vec<&str> = self.modules.iter().map(|m| m.id.as_str()).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(format!("duplicate module id: {}", pair[0]));
        }
        self.channel.validate()?;
        self.health.validate()?;
        self.recording.validate()?;
        self.verification.validate()?;
        Ok(())
    }
}

/// AT channel timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Default deadline for a single AT command.
    pub command_timeout_ms: u64,

    /// Extra attempts for commands sent with retry (timeouts only).
    pub retries: u32,

    /// Consecutive timeouts before the module is marked `Error` and reconnected.
    pub max_consecutive_timeouts: u32,

    /// Delay before each reconnect attempt; the last entry repeats.
    pub reconnect_backoff_ms: Vec<u64>,

    /// How long the reader blocks on the port before re-checking its running flag.
    pub read_poll_ms: u64,

    /// After a timeout, lines arriving within this window are dropped before
    /// the next command is written.
    pub late_reply_drain_ms: u64,
}

impl ChannelSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }

    pub fn late_reply_drain(&self) -> Duration {
        Duration::from_millis(self.late_reply_drain_ms)
    }

    /// Backoff for the `attempt`-th reconnect (0-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let ms = self
            .reconnect_backoff_ms
            .get(attempt)
            .or_else(|| self.reconnect_backoff_ms.last())
            .copied()
            .unwrap_or(1000);
        Duration::from_millis(ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.command_timeout_ms == 0 {
            return Err("command timeout must be positive".into());
        }
        if self.max_consecutive_timeouts == 0 {
            return Err("max consecutive timeouts must be positive".into());
        }
        if self.read_poll_ms == 0 {
            return Err("read poll interval must be positive".into());
        }
        Ok(())
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5000,
            retries: 2,
            max_consecutive_timeouts: 3,
            reconnect_backoff_ms: vec![1000, 2000, 5000, 10000, 30000],
            read_poll_ms: 50,
            late_reply_drain_ms: 500,
        }
    }
}

/// Periodic telemetry polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub poll_interval_ms: u64,
    pub max_missed_polls: u32,
    /// A `Receiving` module with no `RING` for this long returns to `Connected`.
    pub ring_silence_ms: u64,
}

impl HealthSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ring_silence(&self) -> Duration {
        Duration::from_millis(self.ring_silence_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("health poll interval must be positive".into());
        }
        if self.ring_silence_ms < 2 {
            return Err("ring silence timeout must be at least 2ms".into());
        }
        if self.max_missed_polls == 0 {
            return Err("max missed polls must be positive".into());
        }
        Ok(())
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            max_missed_polls: 3,
            ring_silence_ms: 12_000,
        }
    }
}

/// Call timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// Deadline for the `ATD` acknowledgement.
    pub dial_timeout_ms: u64,
    /// How long to wait in `Ringing` for `CONNECT`.
    pub ring_timeout_ms: u64,
    pub max_call_duration_secs: u64,
    /// Terminal calls kept for inspection.
    pub history_capacity: usize,
}

impl CallSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn max_call_duration(&self) -> Duration {
        Duration::from_secs(self.max_call_duration_secs)
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 10_000,
            ring_timeout_ms: 30_000,
            max_call_duration_secs: 3600,
            history_capacity: 100,
        }
    }
}

/// SMS send protocol timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsSettings {
    pub prompt_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub max_length: usize,
    /// Received messages kept after they are read off the SIM.
    pub inbox_capacity: usize,
}

impl SmsSettings {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for SmsSettings {
    fn default() -> Self {
        Self {
            prompt_timeout_ms: 5000,
            send_timeout_ms: 30_000,
            max_length: 160,
            inbox_capacity: 100,
        }
    }
}

pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 16000, 22050, 44100, 48000];

/// Call recording output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Directory where `call_<id>.wav` files are written.
    pub output_directory: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    /// Length of one PCM read.
    pub frame_millis: u64,
    /// In-memory buffer limit; frames beyond it are dropped.
    pub max_duration_secs: u64,
    /// Hex-encoded 32-byte AES-256-GCM key; `None` writes plain WAV.
    pub encryption_key: Option<String>,
}

impl RecordingSettings {
    pub fn format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(format!("unsupported sample rate: {}", self.sample_rate));
        }
        if ![1, 2].contains(&self.channels) {
            return Err(format!("unsupported channel count: {}", self.channels));
        }
        if self.frame_millis == 0 || self.frame_millis > 1000 {
            return Err(format!("frame length out of range: {}ms", self.frame_millis));
        }
        if let Some(ref key) = self.encryption_key {
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err("encryption key must be 64 hex characters".into());
            }
        }
        Ok(())
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("recordings"),
            sample_rate: 8000,
            channels: 1,
            frame_millis: 20,
            max_duration_secs: 3600,
            encryption_key: None,
        }
    }
}

/// OTP issuance and rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub code_ttl_secs: u64,
    pub max_attempts: u32,
    /// Minimum gap between two sends to the same phone.
    pub min_resend_interval_secs: u64,
    pub window_secs: u64,
    pub max_sends_per_window: usize,
    /// Minimum signal (percent) for a module to carry OTP traffic.
    pub min_signal: u8,
    /// How often `send_code` sweeps expired records and idle rate-limit
    /// history. A record is swept once it has been expired this long.
    pub purge_interval_secs: u64,
}

impl VerificationSettings {
    fn validate(&self) -> Result<(), String> {
        if self.code_ttl_secs == 0 {
            return Err("code TTL must be positive".into());
        }
        if self.max_attempts == 0 {
            return Err("max attempts must be positive".into());
        }
        if self.max_sends_per_window == 0 {
            return Err("max sends per window must be positive".into());
        }
        if self.min_signal > 100 {
            return Err("minimum signal is a percentage".into());
        }
        if self.purge_interval_secs == 0 {
            return Err("purge interval must be positive".into());
        }
        Ok(())
    }
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            code_ttl_secs: 300,
            max_attempts: 3,
            min_resend_interval_secs: 60,
            window_secs: 300,
            max_sends_per_window: 3,
            min_signal: 10,
            purge_interval_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_minimal_json() {
        let config = FleetConfig::from_json(
            r#"{
                "modules": [
                    {"id": "m1", "port": "/dev/ttyUSB0", "audio_device": "hw:1,0"},
                    {"id": "m2", "port": "/dev/ttyUSB1", "baud_rate": 115200}
                ],
                "health": {"poll_interval_ms": 45000}
            }"#,
        )
        .unwrap();

        assert_eq!(config.provider, ProviderKind::Sim800c);
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.modules[0].baud_rate, 9600);
        assert_eq!(config.modules[0].audio_device.as_deref(), Some("hw:1,0"));
        assert_eq!(config.health.poll_interval(), Duration::from_secs(45));
        assert_eq!(config.health.max_missed_polls, 3);
        assert_eq!(config.verification.code_ttl_secs, 300);
    }

    #[test]
    fn rejects_duplicate_modules() {
        let result = FleetConfig::from_json(
            r#"{"modules": [
                {"id": "m1", "port": "/dev/ttyUSB0"},
                {"id": "m1", "port": "/dev/ttyUSB1"}
            ]}"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_encryption_key() {
        let mut config = FleetConfig::default();
        config.recording.encryption_key = Some("abcd".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_repeats_last_entry() {
        let settings = ChannelSettings::default();
        assert_eq!(settings.backoff(0), Duration::from_secs(1));
        assert_eq!(settings.backoff(4), Duration::from_secs(30));
        assert_eq!(settings.backoff(12), Duration::from_secs(30));
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a physical GSM module in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Operational status of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Disconnected,
    Connected,
    Calling,
    Receiving,
    Error,
}

impl ModuleStatus {
    /// Whether the module can accept a new outgoing call.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether the serial link is believed to be usable.
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Connected | Self::Calling | Self::Receiving)
    }
}

/// Static configuration of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub id: String,
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Capture device paired with the module's audio output, if any.
    #[serde(default)]
    pub audio_device: Option<String>,
}

fn default_baud_rate() -> u32 {
    9600
}

pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

impl ModuleConfig {
    pub fn new(id: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            port: port.into(),
            baud_rate: default_baud_rate(),
            audio_device: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("module id must not be empty".into());
        }
        if self.port.trim().is_empty() {
            return Err(format!("module {} has no serial port", self.id));
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(format!("unsupported baud rate: {}", self.baud_rate));
        }
        Ok(())
    }
}

/// Telemetry gathered by the health monitor.
///
/// `None` means the last poll could not parse that field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub signal_strength: Option<u8>,
    pub battery_level: Option<u8>,
    pub network_operator: Option<String>,
}

/// A module record as owned by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub id: ModuleId,
    pub port: String,
    pub baud_rate: u32,
    pub status: ModuleStatus,
    /// 0-100 percent.
    pub signal_strength: u8,
    /// 0-100 percent, `None` when the module does not report it.
    pub battery_level: Option<u8>,
    pub network_operator: String,
    pub audio_device: Option<String>,
    /// Caller id of the incoming call while `Receiving`.
    pub incoming_caller: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
}

impl Module {
    pub fn from_config(config: &ModuleConfig) -> Self {
        Self {
            id: ModuleId::new(config.id.clone()),
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            status: ModuleStatus::Disconnected,
            signal_strength: 0,
            battery_level: None,
            network_operator: String::new(),
            audio_device: config.audio_device.clone(),
            incoming_caller: None,
            last_poll: None,
        }
    }

    /// Merge freshly polled telemetry, keeping prior values for fields
    /// that were not reported.
    pub fn apply_telemetry(&mut self, telemetry: &Telemetry) {
        if let Some(signal) = telemetry.signal_strength {
            self.signal_strength = signal;
        }
        if telemetry.battery_level.is_some() {
            self.battery_level = telemetry.battery_level;
        }
        if let Some(ref operator) = telemetry.network_operator {
            self.network_operator = operator.clone();
        }
        self.last_poll = Some(Utc::now());
    }

    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            id: self.id.clone(),
            status: self.status,
            signal_strength: self.signal_strength,
            battery_level: self.battery_level,
            network_operator: self.network_operator.clone(),
            port: self.port.clone(),
            audio_device: self.audio_device.is_some(),
        }
    }
}

/// Serializable module view handed to the business layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub id: ModuleId,
    pub status: ModuleStatus,
    pub signal_strength: u8,
    pub battery_level: Option<u8>,
    pub network_operator: String,
    pub port: String,
    pub audio_device: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        let mut config = ModuleConfig::new("m1", "/dev/ttyUSB0");
        assert!(config.validate().is_ok());

        config.baud_rate = 12345;
        assert!(config.validate().is_err());

        let empty = ModuleConfig::new("", "/dev/ttyUSB0");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn telemetry_keeps_unreported_fields() {
        let mut module = Module::from_config(&ModuleConfig::new("m1", "/dev/ttyUSB0"));
        module.apply_telemetry(&Telemetry {
            signal_strength: Some(64),
            battery_level: Some(90),
            network_operator: Some("Beeline".into()),
        });
        module.apply_telemetry(&Telemetry {
            signal_strength: Some(50),
            battery_level: None,
            network_operator: None,
        });

        assert_eq!(module.signal_strength, 50);
        assert_eq!(module.battery_level, Some(90));
        assert_eq!(module.network_operator, "Beeline");
        assert!(module.last_poll.is_some());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ModuleStatus::Receiving).unwrap();
        assert_eq!(json, "\"receiving\"");
    }
}

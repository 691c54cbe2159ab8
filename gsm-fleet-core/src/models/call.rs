use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::module::ModuleId;
use super::state::{CallStatus, TerminationReason};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn generate() -> Self {
        Self(format!("call_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// A single call.
///
/// `module_id` is a lookup key into the registry, never ownership of the module.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub id: CallId,
    pub module_id: ModuleId,
    pub direction: CallDirection,
    /// SIM number of the module when known.
    pub caller: Option<String>,
    /// Remote party: the dialed number, or the caller id of an incoming call.
    pub called: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub termination: Option<TerminationReason>,
    pub recording_path: Option<PathBuf>,
}

impl CallRecord {
    pub fn new(module_id: ModuleId, called: impl Into<String>) -> Self {
        Self {
            id: CallId::generate(),
            module_id,
            direction: CallDirection::Outgoing,
            caller: None,
            called: called.into(),
            status: CallStatus::Initiated,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            termination: None,
            recording_path: None,
        }
    }

    /// An incoming call already ringing on `module_id`. `caller` is `None`
    /// when the network withheld the caller id.
    pub fn incoming(module_id: ModuleId, caller: Option<String>) -> Self {
        let mut record = Self::new(module_id, caller.unwrap_or_else(|| "unknown".into()));
        record.direction = CallDirection::Incoming;
        record.transition(CallStatus::Ringing);
        record
    }

    /// Apply a transition if the call graph allows it.
    ///
    /// Returns `false` and leaves the record untouched otherwise.
    pub fn transition(&mut self, next: CallStatus) -> bool {
        if !self.status.can_transition_to(next) {
            log::warn!(
                "call {}: rejected transition {:?} -> {:?}",
                self.id,
                self.status,
                next
            );
            return false;
        }
        log::info!("call {}: {:?} -> {:?}", self.id, self.status, next);
        self.status = next;
        match next {
            CallStatus::Active => self.answered_at = Some(Utc::now()),
            CallStatus::Ended | CallStatus::Failed => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        true
    }

    /// Talk time in seconds (answer → end, or answer → now while active).
    pub fn duration_secs(&self) -> Option<f64> {
        let answered = self.answered_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some((end - answered).num_milliseconds() as f64 / 1000.0)
    }

    pub fn summary(&self) -> CallSummary {
        CallSummary {
            call_id: self.id.clone(),
            module_id: self.module_id.clone(),
            direction: self.direction,
            phone: self.called.clone(),
            status: self.status,
            started_at: self.started_at,
            answered_at: self.answered_at,
            ended_at: self.ended_at,
            duration_secs: self.duration_secs(),
            recording_path: self
                .recording_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        }
    }
}

/// Serializable call view handed to the business layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: CallId,
    pub module_id: ModuleId,
    pub direction: CallDirection,
    pub phone: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub recording_path: Option<String>,
}

/// Accepts `+` followed by 3-15 digits, or 3-15 bare digits.
pub fn is_valid_phone_number(number: &str) -> bool {
    let digits = number.strip_prefix('+').unwrap_or(number);
    (3..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::VerifyError;

/// One OTP issued to a phone number for a purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub phone: String,
    pub code: String,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub verified: bool,
}

impl VerificationRecord {
    /// Expired strictly after `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Usable iff not verified, not expired and attempts remain.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.verified && !self.is_expired(now) && !self.attempts_exhausted()
    }
}

/// Outcome of a single code check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCheck {
    pub verified: bool,
    pub remaining_attempts: u32,
}

impl CodeCheck {
    /// A mismatch becomes `VerifyError::Mismatch`.
    pub fn into_result(self) -> Result<(), VerifyError> {
        if self.verified {
            Ok(())
        } else {
            Err(VerifyError::Mismatch {
                remaining_attempts: self.remaining_attempts,
            })
        }
    }
}

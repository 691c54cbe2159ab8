use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::module::ModuleId;

/// An SMS read off a module's SIM and deleted from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedSms {
    pub module_id: ModuleId,
    /// Storage index it occupied on the SIM.
    pub index: u32,
    pub sender: String,
    /// Timestamp reported by the service centre.
    pub sent_at: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

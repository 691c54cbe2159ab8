use crate::models::call::{CallId, CallSummary};
use crate::models::error::{CallError, SmsError};
use crate::models::module::{ModuleId, ModuleSummary};

/// Result of a delivered SMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsReceipt {
    pub module_id: ModuleId,
    /// Reference reported by `+CMGS: <id>`.
    pub message_id: String,
}

/// Something that can deliver SMS.
pub trait SmsProvider: Send + Sync {
    /// Send through a specific module.
    fn send_sms(&self, module: &ModuleId, phone: &str, text: &str) -> Result<SmsReceipt, SmsError>;

    /// Send through the best module with at least `min_signal` percent,
    /// falling back to weaker ones on failure.
    fn send_via_best(&self, phone: &str, text: &str, min_signal: u8) -> Result<SmsReceipt, SmsError>;
}

/// Something that can place voice calls.
pub trait CallProvider: Send + Sync {
    fn make_call(&self, module: &ModuleId, phone: &str) -> Result<CallSummary, CallError>;

    /// Pick up the call ringing on `module`.
    fn answer_call(&self, module: &ModuleId) -> Result<CallSummary, CallError>;

    fn hang_up(&self, call_id: &CallId) -> Result<(), CallError>;

    fn active_calls(&self) -> Vec<CallSummary>;

    fn modules(&self) -> Vec<ModuleSummary>;
}

use crate::models::call::CallSummary;
use crate::models::recording_result::RecordingResult;

/// Observer for call lifecycle notifications.
///
/// All methods are called from the call's supervisor thread; implementations
/// must not block.
pub trait CallObserver: Send + Sync {
    /// Called after every accepted state transition.
    fn on_call_state_changed(&self, call: &CallSummary);

    /// Called when a recording has been finalized.
    fn on_recording_finished(&self, call: &CallSummary, result: &RecordingResult);
}

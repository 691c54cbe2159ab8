use serde::{Deserialize, Serialize};

/// Per-call state machine.
///
/// State transitions:
/// ```text
/// initiated → ringing → active → ended
///     ↓          ↓         ↓
///     └────────→ failed ←──┘ (failed reachable from any non-terminal state)
/// ```
/// An explicit hangup while `ringing` also ends the call as `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Active,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether `self → next` is an edge of the call graph.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        match (self, next) {
            (Initiated, Ringing) => true,
            (Ringing, Active) => true,
            (Ringing, Ended) => true,
            (Active, Ended) => true,
            (Initiated | Ringing | Active, Failed) => true,
            _ => false,
        }
    }
}

/// Why a call reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Remote side hung up (`NO CARRIER` while active).
    RemoteHangup,
    /// `hang_up` was requested by the business layer.
    LocalHangup,
    Busy,
    NoAnswer,
    /// Ring timeout elapsed without `CONNECT`.
    RingTimeout,
    MaxDurationReached,
    DialRejected(String),
    /// `ATA` failed, usually because the caller already hung up.
    AnswerFailed(String),
    LinkLost,
    Shutdown,
}

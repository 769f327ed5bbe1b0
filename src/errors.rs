//! Error taxonomy shared across slot filesystem, sink, and dispatcher
//! components.

use thiserror::Error;

/// Errors that can occur while resolving or reading the slot filesystem
/// contract (C1/C2).
#[derive(Debug, Error)]
pub enum SlotFsError {
    #[error("invalid slot_id (use alnum, dot, underscore, dash)")]
    InvalidSlotId,
    #[error("slot path escapes slots root")]
    PathEscape,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the verified-event sink (C7).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid worker secret")]
    AuthFailure,
}

/// Why the supervisor decided to restart a slot. Not an error type — a
/// stale heartbeat, a dead process, and a dead pid are all routine,
/// expected conditions the supervisor reacts to, not failures it reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    HeartbeatMissing,
    HeartbeatStale { age_seconds: u64 },
    ProcessExited,
    PidNotAlive,
}

impl RestartReason {
    pub fn describe(&self) -> String {
        match self {
            RestartReason::HeartbeatMissing => "heartbeat missing".to_string(),
            RestartReason::HeartbeatStale { age_seconds } => {
                format!("heartbeat stale ({age_seconds}s)")
            }
            RestartReason::ProcessExited => "process exited".to_string(),
            RestartReason::PidNotAlive => "pid not alive".to_string(),
        }
    }
}

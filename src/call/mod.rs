//! Call model and controller: the single call slot, its state machine, and
//! the history of ended calls.
//!
//! "Idle" has no variant of its own: the controller's current-call slot is
//! an `Option<Call>` and idle is the `None` case. Everything that mutates a
//! call goes through the controller task.

#[cfg(feature = "audio")]
pub mod audio;
pub mod controller;
pub mod headless;
pub mod log;
pub mod media;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Opaque call identifier, shared between the controller and the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        CallId(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex chars are plenty for log correlation.
        f.write_str(&self.0.simple().to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle of the call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Outbound INVITE sent, no final answer yet.
    Establishing,
    /// Inbound call ringing locally.
    Ringing,
    Active,
    Held,
    Terminated,
}

/// One in-progress call.
#[derive(Debug, Clone)]
pub struct Call {
    pub id: CallId,
    /// Dialed number or caller URI user part.
    pub remote: String,
    pub display_name: Option<String>,
    pub direction: Direction,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    /// Whole seconds spent in `Active`; frozen while held, never reset.
    pub duration_secs: u64,
    pub muted: bool,
    /// True when the silent capture fallback is in use.
    pub listen_only: bool,
}

impl Call {
    pub fn outbound(number: &str) -> Self {
        Call {
            id: CallId::new(),
            remote: number.to_string(),
            display_name: None,
            direction: Direction::Outbound,
            state: CallState::Establishing,
            started_at: Utc::now(),
            duration_secs: 0,
            muted: false,
            listen_only: false,
        }
    }

    pub fn inbound(id: CallId, remote: &str, display_name: Option<String>) -> Self {
        Call {
            id,
            remote: remote.to_string(),
            display_name,
            direction: Direction::Inbound,
            state: CallState::Ringing,
            started_at: Utc::now(),
            duration_secs: 0,
            muted: false,
            listen_only: false,
        }
    }

    /// Caller name when known, otherwise the number.
    pub fn who(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.remote)
    }
}

/// How a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Established, then ended by either side.
    Completed,
    /// Inbound, rang here, the caller gave up before an answer.
    Missed,
    /// Outbound, canceled here before an answer.
    Canceled,
    /// Refused by the PBX or cut by transport loss before establishment.
    Failed,
}

impl CallOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CallOutcome::Completed => "completed",
            CallOutcome::Missed => "missed",
            CallOutcome::Canceled => "canceled",
            CallOutcome::Failed => "failed",
        }
    }
}

/// A terminated call, as kept in the newest-first history list and appended
/// to the JSONL call log.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: CallId,
    pub remote: String,
    pub display_name: Option<String>,
    pub direction: Direction,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
}

impl HistoryEntry {
    pub fn from_call(call: &Call, outcome: CallOutcome) -> Self {
        HistoryEntry {
            id: call.id,
            remote: call.remote.clone(),
            display_name: call.display_name.clone(),
            direction: call.direction,
            outcome,
            started_at: call.started_at,
            duration_secs: call.duration_secs,
        }
    }

    pub fn who(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.remote)
    }
}

/// Elapsed-time display used by the in-call panel and history: `m:ss`.
pub fn fmt_duration(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(0), "0:00");
        assert_eq!(fmt_duration(9), "0:09");
        assert_eq!(fmt_duration(65), "1:05");
        assert_eq!(fmt_duration(3723), "62:03");
    }

    #[test]
    fn test_history_entry_snapshots_call() {
        let mut call = Call::outbound("0501234567");
        call.state = CallState::Active;
        call.duration_secs = 42;

        let entry = HistoryEntry::from_call(&call, CallOutcome::Completed);
        assert_eq!(entry.id, call.id);
        assert_eq!(entry.remote, "0501234567");
        assert_eq!(entry.direction, Direction::Outbound);
        assert_eq!(entry.duration_secs, 42);
        assert_eq!(entry.outcome, CallOutcome::Completed);
    }

    #[test]
    fn test_history_entry_serializes_to_json() {
        let call = Call::inbound(CallId::new(), "200", Some("North Station".to_string()));
        let entry = HistoryEntry::from_call(&call, CallOutcome::Missed);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"direction\":\"inbound\""));
        assert!(json.contains("\"outcome\":\"missed\""));
        assert!(json.contains("\"remote\":\"200\""));
    }

    #[test]
    fn test_who_prefers_display_name() {
        let call = Call::inbound(CallId::new(), "200", Some("North Station".to_string()));
        assert_eq!(call.who(), "North Station");
        let call = Call::outbound("0501234567");
        assert_eq!(call.who(), "0501234567");
    }
}

// Session Models
// State machine and status snapshot for the stream session controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of the streaming session.
///
/// One session moves Idle -> Starting -> Running -> Stopping -> Stopped;
/// Starting and Running divert to Failed on launch error or abnormal exit.
/// Stopped and Failed are terminal for that session, and the controller
/// accepts a fresh start from either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// Terminal states keep their session around for inspection but no
    /// longer hold a live process.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

/// Snapshot returned by the controller's poll: the current state plus
/// whatever the monitor produced since the previous poll. Plain data only,
/// nothing here can block on the child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: SessionState,
    /// Output lines captured since the last poll, in arrival order
    pub new_lines: Vec<String>,
    /// Exit code of the encoder process once it has exited; None while it
    /// is running or when it was killed by a signal
    pub exit_code: Option<i32>,
    /// Rendered failure description when the session failed
    pub error: Option<String>,
    /// Id of the session the report describes, if one exists
    pub session_id: Option<Uuid>,
    /// When the encoder process was spawned
    pub started_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    /// Report for a controller with no session yet
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            new_lines: Vec::new(),
            exit_code: None,
            error: None,
            session_id: None,
            started_at: None,
        }
    }
}

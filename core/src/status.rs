use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Activity classification for a pane or session.
///
/// The declaration order doubles as the aggregation priority: a session's
/// status is the maximum over its panes, so a session with any thinking pane
/// lists as thinking, and an errored pane always wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created but not started, or restored from disk.
    #[default]
    Idle,
    /// Child process has terminated.
    Stopped,
    /// A plain shell is at the prompt.
    Shell,
    /// An agent is waiting for user input.
    WaitingInput,
    /// An agent is running a tool.
    Executing,
    /// An agent is producing a response.
    Thinking,
    Error,
}

impl Status {
    /// True for the terminal states the timeout monitor never acts on.
    pub fn is_settled(self) -> bool {
        matches!(self, Status::Stopped | Status::Error | Status::Idle)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Idle => "idle",
            Status::Stopped => "stopped",
            Status::Shell => "shell",
            Status::WaitingInput => "waiting_input",
            Status::Executing => "executing",
            Status::Thinking => "thinking",
            Status::Error => "error",
        };
        write!(f, "{name}")
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaneError {
    #[error("pane is not attached to a pty")]
    Closed,
    #[error("pane state lock poisoned")]
    Poisoned,
    #[error("pane is already running; reset it before starting again")]
    AlreadyRunning,
    #[error("failed to spawn child process: {pty_error}")]
    Spawn {
        #[source]
        pty_error: anyhow::Error,
    },
    #[error("failed to write to pty: {error}")]
    Write {
        #[source]
        error: std::io::Error,
    },
    #[error("failed to resize pty: {pty_error}")]
    Resize {
        #[source]
        pty_error: anyhow::Error,
    },
}

impl PaneError {
    pub(crate) fn spawn(pty_error: anyhow::Error) -> Self {
        Self::Spawn { pty_error }
    }

    pub(crate) fn resize(pty_error: anyhow::Error) -> Self {
        Self::Resize { pty_error }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session not found: {id}")]
    SessionNotFound { id: String },
    #[error("session state lock poisoned")]
    Poisoned,
    #[error("pane not found: {id}")]
    PaneNotFound { id: String },
    #[error("failed to persist session state: {error}")]
    Persistence {
        #[source]
        error: std::io::Error,
    },
    #[error("failed to encode session metadata: {error}")]
    Serialize {
        #[source]
        error: serde_json::Error,
    },
}

impl ManagerError {
    pub(crate) fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound { id: id.into() }
    }

    pub(crate) fn persistence(error: std::io::Error) -> Self {
        Self::Persistence { error }
    }
}

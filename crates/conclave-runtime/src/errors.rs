//! Runtime error types.

use std::time::Duration;

use conclave_core::SessionId;
use conclave_process::ProcessError;
use conclave_store::StoreError;
use conclave_worktree::WorktreeError;

/// Everything a command against the session engine can fail with.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Starting another process would exceed the configured ceiling.
    #[error("session limit reached ({max} running)")]
    CapacityExceeded { max: usize },

    #[error("session {0} is not running")]
    SessionNotRunning(SessionId),

    #[error("session {0} is already running")]
    AlreadyRunning(SessionId),

    #[error("no session selected")]
    NoActiveSession,

    #[error("no project selected")]
    NoActiveProject,

    #[error("working copy not ready after {0:?}")]
    StartTimeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Short category string for status lines and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Worktree(_) => "worktree",
            Self::Process(_) => "process",
            Self::Store(_) => "persistence",
            Self::CapacityExceeded { .. } => "capacity",
            Self::SessionNotRunning(_) => "not_running",
            Self::AlreadyRunning(_) => "already_running",
            Self::NoActiveSession | Self::NoActiveProject => "selection",
            Self::StartTimeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

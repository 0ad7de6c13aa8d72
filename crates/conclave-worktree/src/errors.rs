use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {}", .0.display())]
    RepoNotFound(PathBuf),

    #[error("worktree conflict: {0}")]
    Conflict(String),

    #[error("invalid session name for a worktree: {0:?}")]
    InvalidName(String),

    #[error("repository has no commit to branch from: {0}")]
    NoHead(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_not_found_display() {
        let err = WorktreeError::RepoNotFound(PathBuf::from("/nowhere"));
        assert_eq!(err.to_string(), "not a git repository: /nowhere");
    }

    #[test]
    fn git_error_from_conversion() {
        let err: WorktreeError = git2::Error::from_str("boom").into();
        assert!(matches!(err, WorktreeError::Git(_)));
    }
}

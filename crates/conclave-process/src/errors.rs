use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to open pseudo-terminal: {0}")]
    Pty(String),

    #[error("failed to spawn {binary}: {detail}")]
    Spawn { binary: String, detail: String },

    #[error("failed to start I/O thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("process closed")]
    Closed,

    #[error("write to process failed: {0}")]
    Write(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_display_names_binary() {
        let err = ProcessError::Spawn {
            binary: "agent".into(),
            detail: "No such file or directory".into(),
        };
        assert_eq!(err.to_string(), "failed to spawn agent: No such file or directory");
    }

    #[test]
    fn closed_display() {
        assert_eq!(ProcessError::Closed.to_string(), "process closed");
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux command failed: {0}")]
    CommandFailed(String),
    #[error("tmux not found")]
    NotFound,
    #[error("pane missing: {0}")]
    PaneMissing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
}

impl TmuxError {
    /// True when the error means the pane (or its window) no longer exists.
    /// This is terminal for a pane actor; every other tmux error is treated
    /// as transient and retried on the next tick.
    pub fn is_pane_missing(&self) -> bool {
        matches!(self, Self::PaneMissing(_))
    }
}

/// Classify tmux stderr text. tmux reports a vanished target with
/// "can't find pane" or "can't find window" depending on the command.
pub fn is_pane_missing_message(stderr: &str) -> bool {
    stderr.contains("can't find pane") || stderr.contains("can't find window")
}

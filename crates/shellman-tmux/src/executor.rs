//! Async tmux command executor.
//!
//! Each call spawns one `tmux` child process; there is no persistent
//! connection, so the executor is freely shareable and concurrent calls
//! are permitted.

use tokio::process::Command;

use crate::error::{is_pane_missing_message, TmuxError};

#[derive(Debug, Clone)]
pub struct TmuxExecutor {
    tmux_bin: String,
    socket: Option<String>,
}

impl TmuxExecutor {
    /// Executor for the default `tmux` binary and server socket.
    pub fn new() -> Self {
        Self {
            tmux_bin: "tmux".into(),
            socket: None,
        }
    }

    /// Executor against a specific server socket path (`tmux -S`).
    pub fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            tmux_bin: "tmux".into(),
            socket: Some(socket.into()),
        }
    }

    pub fn with_bin(bin: impl Into<String>, socket: Option<String>) -> Self {
        Self {
            tmux_bin: bin.into(),
            socket,
        }
    }

    pub fn tmux_bin(&self) -> &str {
        &self.tmux_bin
    }

    pub fn socket(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    /// Full argv prefix including the socket flag, for callers that spawn
    /// long-lived tmux children themselves (control mode).
    pub fn base_args(&self) -> Vec<String> {
        match &self.socket {
            Some(s) => vec!["-S".into(), s.clone()],
            None => Vec::new(),
        }
    }

    /// Run a tmux command and return stdout.
    ///
    /// Non-zero exits are classified: a vanished target maps to
    /// [`TmuxError::PaneMissing`], everything else to
    /// [`TmuxError::CommandFailed`].
    pub async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let mut cmd = Command::new(&self.tmux_bin);
        if let Some(socket) = &self.socket {
            cmd.arg("-S").arg(socket);
        }
        cmd.args(args);

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TmuxError::NotFound
            } else {
                TmuxError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if is_pane_missing_message(stderr) {
                return Err(TmuxError::PaneMissing(stderr.to_owned()));
            }
            return Err(TmuxError::CommandFailed(format!(
                "exit {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                stderr,
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TmuxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

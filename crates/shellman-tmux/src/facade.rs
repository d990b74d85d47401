//! Capability facade over the tmux server.
//!
//! The daemon never shells out to tmux directly; everything goes through
//! [`TmuxFacade`], which has a real-process implementation ([`RealTmux`])
//! and an in-memory one ([`crate::fake::FakeTmux`]) for actor tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::TmuxError;
use crate::executor::TmuxExecutor;

/// One pane as reported by `list-panes -a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneListing {
    /// `session:window.pane` target, unique per tmux server.
    pub target: String,
    /// tmux pane id (`%N`), stable across window renumbering.
    pub pane_id: String,
    /// Session the pane belongs to.
    pub session: String,
    /// PID of the pane's root process.
    pub pane_pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPos {
    pub x: u32,
    pub y: u32,
}

#[async_trait]
pub trait TmuxFacade: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<PaneListing>, TmuxError>;
    async fn pane_exists(&self, target: &str) -> Result<bool, TmuxError>;
    async fn select_pane(&self, target: &str) -> Result<(), TmuxError>;
    async fn send_input(&self, target: &str, text: &str) -> Result<(), TmuxError>;
    async fn resize(&self, target: &str, cols: u32, rows: u32) -> Result<(), TmuxError>;
    /// Visible-pane snapshot.
    async fn capture_pane(&self, target: &str) -> Result<String, TmuxError>;
    /// Snapshot including the last `lines` lines of scrollback.
    async fn capture_history(&self, target: &str, lines: u32) -> Result<String, TmuxError>;
    async fn start_pipe_pane(&self, target: &str, command: &str) -> Result<(), TmuxError>;
    async fn stop_pipe_pane(&self, target: &str) -> Result<(), TmuxError>;
    /// Cursor position, if the pane reports one.
    async fn cursor_position(&self, target: &str) -> Result<Option<CursorPos>, TmuxError>;
    /// Split beside `target`; returns the new pane's target.
    async fn create_sibling_pane(&self, target: &str) -> Result<String, TmuxError>;
    async fn create_sibling_pane_in_dir(&self, target: &str, dir: &str)
        -> Result<String, TmuxError>;
    /// Split below `target`; returns the new pane's target.
    async fn create_child_pane(&self, target: &str) -> Result<String, TmuxError>;
    async fn create_child_pane_in_dir(&self, target: &str, dir: &str)
        -> Result<String, TmuxError>;
    /// New window in `session`; returns the new pane's target.
    async fn create_root_pane(&self, session: &str) -> Result<String, TmuxError>;
    async fn create_root_pane_in_dir(&self, session: &str, dir: &str)
        -> Result<String, TmuxError>;
    async fn pane_last_active_at(&self, target: &str)
        -> Result<Option<DateTime<Utc>>, TmuxError>;
    async fn pane_title_and_current_command(
        &self,
        target: &str,
    ) -> Result<(String, String), TmuxError>;
    async fn get_pane_option(&self, target: &str, name: &str)
        -> Result<Option<String>, TmuxError>;
    async fn set_pane_option(&self, target: &str, name: &str, value: &str)
        -> Result<(), TmuxError>;
    /// Identifier distinguishing tmux server incarnations (socket + pid).
    async fn server_instance_id(&self) -> Result<String, TmuxError>;
}

// ---------------------------------------------------------------------------
// RealTmux
// ---------------------------------------------------------------------------

const TARGET_FORMAT: &str = "#{session_name}:#{window_index}.#{pane_index}";

/// Shell rc sourced by every pane shellman creates. Marks the pane ready on
/// the first prompt so callers can poll `@shellman_ready` instead of racing
/// the shell startup.
const READY_RC: &str = r#"if [ -f "$HOME/.bashrc" ]; then . "$HOME/.bashrc"; fi
__shellman_ready() {
  tmux set-option -p @shellman_ready 1
  PROMPT_COMMAND=""
  unset -f __shellman_ready
}
PROMPT_COMMAND=__shellman_ready
"#;

pub struct RealTmux {
    exec: TmuxExecutor,
}

impl RealTmux {
    pub fn new(exec: TmuxExecutor) -> Self {
        Self { exec }
    }

    pub fn executor(&self) -> &TmuxExecutor {
        &self.exec
    }

    /// Write the ready rc-file (idempotent) and return the shell command
    /// new panes run.
    async fn ready_shell_command(&self) -> Result<String, TmuxError> {
        let dir = std::env::temp_dir().join("shellman");
        tokio::fs::create_dir_all(&dir).await?;
        let rc = dir.join("ready.bashrc");
        tokio::fs::write(&rc, READY_RC).await?;
        Ok(format!("bash --rcfile '{}' -i", rc.display()))
    }

    async fn split(&self, target: &str, flag: &str, dir: Option<&str>)
        -> Result<String, TmuxError> {
        let shell = self.ready_shell_command().await?;
        let mut args = vec![
            "split-window", flag, "-t", target, "-P", "-F", TARGET_FORMAT,
        ];
        if let Some(d) = dir {
            args.push("-c");
            args.push(d);
        }
        args.push(&shell);
        let out = self.exec.run(&args).await?;
        Ok(out.trim().to_owned())
    }
}

#[async_trait]
impl TmuxFacade for RealTmux {
    async fn list_sessions(&self) -> Result<Vec<PaneListing>, TmuxError> {
        let format = format!("{TARGET_FORMAT}\t#{{pane_id}}\t#{{session_name}}\t#{{pane_pid}}");
        let out = self
            .exec
            .run(&["list-panes", "-a", "-F", &format])
            .await?;
        let mut panes = Vec::new();
        for line in out.lines() {
            let mut parts = line.split('\t');
            let (Some(target), Some(pane_id), Some(session), Some(pid)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let pane_pid = pid
                .trim()
                .parse::<u32>()
                .map_err(|_| TmuxError::Parse(format!("bad pane_pid in line: {line}")))?;
            panes.push(PaneListing {
                target: target.to_owned(),
                pane_id: pane_id.to_owned(),
                session: session.to_owned(),
                pane_pid,
            });
        }
        Ok(panes)
    }

    async fn pane_exists(&self, target: &str) -> Result<bool, TmuxError> {
        match self
            .exec
            .run(&["display-message", "-p", "-t", target, "#{pane_id}"])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_pane_missing() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn select_pane(&self, target: &str) -> Result<(), TmuxError> {
        self.exec.run(&["select-pane", "-t", target]).await?;
        Ok(())
    }

    async fn send_input(&self, target: &str, text: &str) -> Result<(), TmuxError> {
        self.exec
            .run(&["send-keys", "-t", target, "-l", "--", text])
            .await?;
        Ok(())
    }

    async fn resize(&self, target: &str, cols: u32, rows: u32) -> Result<(), TmuxError> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        self.exec
            .run(&["resize-pane", "-t", target, "-x", &cols, "-y", &rows])
            .await?;
        Ok(())
    }

    async fn capture_pane(&self, target: &str) -> Result<String, TmuxError> {
        self.exec.run(&["capture-pane", "-p", "-t", target]).await
    }

    async fn capture_history(&self, target: &str, lines: u32) -> Result<String, TmuxError> {
        let start = format!("-{lines}");
        self.exec
            .run(&["capture-pane", "-p", "-t", target, "-S", &start])
            .await
    }

    async fn start_pipe_pane(&self, target: &str, command: &str) -> Result<(), TmuxError> {
        self.exec
            .run(&["pipe-pane", "-t", target, "-O", command])
            .await?;
        Ok(())
    }

    async fn stop_pipe_pane(&self, target: &str) -> Result<(), TmuxError> {
        // No command argument detaches the pipe.
        self.exec.run(&["pipe-pane", "-t", target]).await?;
        Ok(())
    }

    async fn cursor_position(&self, target: &str) -> Result<Option<CursorPos>, TmuxError> {
        let out = self
            .exec
            .run(&[
                "display-message",
                "-p",
                "-t",
                target,
                "#{cursor_x} #{cursor_y}",
            ])
            .await?;
        let mut parts = out.split_whitespace();
        let (Some(x), Some(y)) = (parts.next(), parts.next()) else {
            return Ok(None);
        };
        match (x.parse::<u32>(), y.parse::<u32>()) {
            (Ok(x), Ok(y)) => Ok(Some(CursorPos { x, y })),
            _ => Ok(None),
        }
    }

    async fn create_sibling_pane(&self, target: &str) -> Result<String, TmuxError> {
        self.split(target, "-h", None).await
    }

    async fn create_sibling_pane_in_dir(
        &self,
        target: &str,
        dir: &str,
    ) -> Result<String, TmuxError> {
        self.split(target, "-h", Some(dir)).await
    }

    async fn create_child_pane(&self, target: &str) -> Result<String, TmuxError> {
        self.split(target, "-v", None).await
    }

    async fn create_child_pane_in_dir(
        &self,
        target: &str,
        dir: &str,
    ) -> Result<String, TmuxError> {
        self.split(target, "-v", Some(dir)).await
    }

    async fn create_root_pane(&self, session: &str) -> Result<String, TmuxError> {
        let shell = self.ready_shell_command().await?;
        let out = self
            .exec
            .run(&[
                "new-window", "-t", session, "-P", "-F", TARGET_FORMAT, &shell,
            ])
            .await?;
        Ok(out.trim().to_owned())
    }

    async fn create_root_pane_in_dir(
        &self,
        session: &str,
        dir: &str,
    ) -> Result<String, TmuxError> {
        let shell = self.ready_shell_command().await?;
        let out = self
            .exec
            .run(&[
                "new-window", "-t", session, "-c", dir, "-P", "-F", TARGET_FORMAT, &shell,
            ])
            .await?;
        Ok(out.trim().to_owned())
    }

    async fn pane_last_active_at(
        &self,
        target: &str,
    ) -> Result<Option<DateTime<Utc>>, TmuxError> {
        let out = self
            .exec
            .run(&["display-message", "-p", "-t", target, "#{pane_activity}"])
            .await?;
        let Ok(secs) = out.trim().parse::<i64>() else {
            return Ok(None);
        };
        Ok(Utc.timestamp_opt(secs, 0).single())
    }

    async fn pane_title_and_current_command(
        &self,
        target: &str,
    ) -> Result<(String, String), TmuxError> {
        let out = self
            .exec
            .run(&[
                "display-message",
                "-p",
                "-t",
                target,
                "#{pane_title}\t#{pane_current_command}",
            ])
            .await?;
        let line = out.trim_end_matches('\n');
        match line.split_once('\t') {
            Some((title, cmd)) => Ok((title.to_owned(), cmd.to_owned())),
            None => Ok((line.to_owned(), String::new())),
        }
    }

    async fn get_pane_option(
        &self,
        target: &str,
        name: &str,
    ) -> Result<Option<String>, TmuxError> {
        let out = self
            .exec
            .run(&["show-options", "-p", "-t", target, "-v", name])
            .await?;
        let value = out.trim();
        if value.is_empty() {
            Ok(None)
        } else {
            Ok(Some(value.to_owned()))
        }
    }

    async fn set_pane_option(
        &self,
        target: &str,
        name: &str,
        value: &str,
    ) -> Result<(), TmuxError> {
        self.exec
            .run(&["set-option", "-p", "-t", target, name, value])
            .await?;
        Ok(())
    }

    async fn server_instance_id(&self) -> Result<String, TmuxError> {
        let out = self
            .exec
            .run(&["display-message", "-p", "#{socket_path}:#{pid}"])
            .await?;
        Ok(out.trim().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_rc_marks_pane_once() {
        assert!(READY_RC.contains("@shellman_ready 1"));
        assert!(READY_RC.contains("PROMPT_COMMAND=__shellman_ready"));
        // The marker must disarm itself after the first prompt.
        assert!(READY_RC.contains("unset -f __shellman_ready"));
    }

    #[test]
    fn listing_format_has_all_fields() {
        assert!(TARGET_FORMAT.contains("session_name"));
        assert!(TARGET_FORMAT.contains("window_index"));
        assert!(TARGET_FORMAT.contains("pane_index"));
    }
}

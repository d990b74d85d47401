//! Pane and filesystem I/O tools: write_stdin, exec_command, readfile,
//! and the task-scoped input prompt.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use shellman_core::input::InputTracker;
use shellman_llm::args::{
    ExecCommandArgs, InputPromptArgs, ReadfileArgs, WriteStdinArgs,
};
use shellman_llm::tool::{Tool, ToolError, ToolScope};
use shellman_llm::types::ToolSpec;
use shellman_tmux::TmuxFacade;

use super::tmux_tool_error;

/// Tail kept from the pane after a write, so the model sees the effect.
const WRITE_ECHO_TAIL_CHARS: usize = 2000;

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Rough chars-per-token budget used when trimming tool output.
const CHARS_PER_TOKEN: usize = 4;

fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn head_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

// ---------------------------------------------------------------------------
// write_stdin
// ---------------------------------------------------------------------------

pub struct WriteStdinTool {
    tmux: Arc<dyn TmuxFacade>,
    input_tracker: Arc<Mutex<InputTracker>>,
    raw_shell_mode: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl WriteStdinTool {
    pub fn new(
        tmux: Arc<dyn TmuxFacade>,
        input_tracker: Arc<Mutex<InputTracker>>,
        raw_shell_mode: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            tmux,
            input_tracker,
            raw_shell_mode,
        }
    }
}

#[async_trait]
impl Tool for WriteStdinTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "write_stdin",
            "Write raw bytes to the active pane's stdin, wait briefly, and return the pane tail.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "input": { "type": "string" },
                    "timeout_ms": { "type": "integer", "minimum": 100, "maximum": 15000 },
                },
                "required": ["input"],
            }),
        )
    }

    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        let valid = WriteStdinArgs::parse_and_validate(arguments, (self.raw_shell_mode)())?;
        let target = scope.require_pane()?;

        self.tmux
            .send_input(target, &valid.input)
            .await
            .map_err(|e| tmux_tool_error(&e))?;
        {
            let mut tracker = self.input_tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.record(target, Utc::now());
        }

        tokio::time::sleep(Duration::from_millis(valid.timeout_ms)).await;
        let snapshot = self
            .tmux
            .capture_pane(target)
            .await
            .map_err(|e| tmux_tool_error(&e))?;

        Ok(serde_json::json!({
            "ok": true,
            "output": tail_chars(&snapshot, WRITE_ECHO_TAIL_CHARS),
        })
        .to_string())
    }
}

// ---------------------------------------------------------------------------
// exec_command
// ---------------------------------------------------------------------------

pub struct ExecCommandTool;

impl ExecCommandTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExecCommandTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ExecCommandTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "exec_command",
            "Run a shell command to completion and return its combined output.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "max_output_tokens": { "type": "integer", "minimum": 128, "maximum": 8000 },
                },
                "required": ["command"],
            }),
        )
    }

    async fn execute(
        &self,
        _scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        let (command, max_tokens) = ExecCommandArgs::parse_and_validate(arguments)?;

        let run = tokio::process::Command::new("bash")
            .arg("-lc")
            .arg(&command)
            .output();
        let output = match tokio::time::timeout(EXEC_TIMEOUT, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::new(
                    format!("spawn failed: {e}"),
                    "check that a shell is available on this host",
                ))
            }
            Err(_) => {
                return Err(ToolError::new(
                    "command timed out",
                    "run long-lived commands in a pane via write_stdin instead",
                ))
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let budget = max_tokens as usize * CHARS_PER_TOKEN;
        let (trimmed, truncated) = head_chars(&combined, budget);

        Ok(serde_json::json!({
            "exit_code": output.status.code(),
            "output": trimmed,
            "truncated": truncated,
        })
        .to_string())
    }
}

// ---------------------------------------------------------------------------
// readfile
// ---------------------------------------------------------------------------

pub struct ReadfileTool;

impl ReadfileTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReadfileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadfileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "readfile",
            "Read a file from the local filesystem, truncated to max_chars.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "max_chars": { "type": "integer", "minimum": 128, "maximum": 200000 },
                },
                "required": ["path"],
            }),
        )
    }

    async fn execute(
        &self,
        _scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        let (path, max_chars) = ReadfileArgs::parse_and_validate(arguments)?;
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::new(
                format!("cannot read {path}: {e}"),
                "check the path; use exec_command with ls to explore",
            )
        })?;
        let (trimmed, truncated) = head_chars(&content, max_chars as usize);
        Ok(serde_json::json!({
            "path": path,
            "content": trimmed,
            "truncated": truncated,
        })
        .to_string())
    }
}

// ---------------------------------------------------------------------------
// task.input_prompt
// ---------------------------------------------------------------------------

pub struct InputPromptTool {
    tmux: Arc<dyn TmuxFacade>,
    input_tracker: Arc<Mutex<InputTracker>>,
}

impl InputPromptTool {
    pub fn new(tmux: Arc<dyn TmuxFacade>, input_tracker: Arc<Mutex<InputTracker>>) -> Self {
        Self {
            tmux,
            input_tracker,
        }
    }
}

#[async_trait]
impl Tool for InputPromptTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "task.input_prompt",
            "Send a prompt line to the task's pane; a carriage return is appended when missing.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string" },
                },
                "required": ["prompt"],
            }),
        )
    }

    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        scope.require_task()?;
        let target = scope.require_pane()?;
        let prompt = InputPromptArgs::parse_and_validate(arguments)?;

        self.tmux
            .send_input(target, &prompt)
            .await
            .map_err(|e| tmux_tool_error(&e))?;
        {
            let mut tracker = self.input_tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.record(target, Utc::now());
        }
        Ok(serde_json::json!({ "ok": true }).to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use shellman_tmux::FakeTmux;

    fn pane_scope() -> ToolScope {
        ToolScope {
            project_id: Some("p1".into()),
            task_id: Some("t1".into()),
            pane_target: Some("e2e:0.0".into()),
        }
    }

    #[test]
    fn tail_and_head_respect_char_boundaries() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("你好世界", 2), "世界");

        assert_eq!(head_chars("abcdef", 3), ("abc", true));
        assert_eq!(head_chars("ab", 3), ("ab", false));
        assert_eq!(head_chars("你好世界", 2), ("你好", true));
    }

    #[tokio::test]
    async fn write_stdin_sends_and_returns_tail() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("e2e:0.0", "prompt$ ");
        let tool = WriteStdinTool::new(
            Arc::clone(&tmux) as Arc<dyn TmuxFacade>,
            Arc::new(Mutex::new(InputTracker::new())),
            Arc::new(|| false),
        );

        let out = tool
            .execute(&pane_scope(), r#"{"input":"y\r","timeout_ms":100}"#, "call_1")
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["ok"], true);
        assert!(parsed["output"].as_str().unwrap().contains("prompt$"));
        assert_eq!(tmux.sent_inputs(), vec![("e2e:0.0".to_owned(), "y\r".to_owned())]);
    }

    #[tokio::test]
    async fn write_stdin_raw_mode_rejects_unsubmitted() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("e2e:0.0", "");
        let tool = WriteStdinTool::new(
            Arc::clone(&tmux) as Arc<dyn TmuxFacade>,
            Arc::new(Mutex::new(InputTracker::new())),
            Arc::new(|| true),
        );

        let err = tool
            .execute(&pane_scope(), r#"{"input":"ls -la","timeout_ms":100}"#, "call_1")
            .await
            .unwrap_err();
        assert!(err.error.contains("complete shell command"));
        assert!(tmux.sent_inputs().is_empty(), "nothing reached the pane");
    }

    #[tokio::test]
    async fn write_stdin_without_pane_scope_errors() {
        let tool = WriteStdinTool::new(
            Arc::new(FakeTmux::new()) as Arc<dyn TmuxFacade>,
            Arc::new(Mutex::new(InputTracker::new())),
            Arc::new(|| false),
        );
        let err = tool
            .execute(&ToolScope::default(), r#"{"input":"x"}"#, "call_1")
            .await
            .unwrap_err();
        assert!(err.error.contains("pane"));
    }

    #[tokio::test]
    async fn exec_command_runs_and_reports_exit() {
        let tool = ExecCommandTool::new();
        let out = tool
            .execute(
                &ToolScope::default(),
                r#"{"command":"echo tool-output; exit 0"}"#,
                "call_1",
            )
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["exit_code"], 0);
        assert!(parsed["output"].as_str().unwrap().contains("tool-output"));
        assert_eq!(parsed["truncated"], false);
    }

    #[tokio::test]
    async fn readfile_reads_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.txt");
        tokio::fs::write(&path, "0123456789".repeat(100)).await.unwrap();

        let tool = ReadfileTool::new();
        let args = format!(r#"{{"path":"{}","max_chars":128}}"#, path.display());
        let out = tool.execute(&ToolScope::default(), &args, "call_1").await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["content"].as_str().unwrap().len(), 128);
        assert_eq!(parsed["truncated"], true);

        let err = tool
            .execute(&ToolScope::default(), r#"{"path":"/no/such/file"}"#, "call_1")
            .await
            .unwrap_err();
        assert!(err.error.contains("cannot read"));
        assert!(!err.suggest.is_empty());
    }

    #[tokio::test]
    async fn input_prompt_appends_submit_and_requires_scope() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("e2e:0.0", "");
        let tool = InputPromptTool::new(
            Arc::clone(&tmux) as Arc<dyn TmuxFacade>,
            Arc::new(Mutex::new(InputTracker::new())),
        );

        tool.execute(&pane_scope(), r#"{"prompt":"continue"}"#, "call_1")
            .await
            .unwrap();
        assert_eq!(
            tmux.sent_inputs(),
            vec![("e2e:0.0".to_owned(), "continue\r".to_owned())]
        );

        let no_task = ToolScope {
            pane_target: Some("e2e:0.0".into()),
            ..ToolScope::default()
        };
        let err = tool
            .execute(&no_task, r#"{"prompt":"x"}"#, "call_1")
            .await
            .unwrap_err();
        assert!(err.error.contains("task scope"));
    }
}

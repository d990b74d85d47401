//! Tool argument parsing and validation.
//!
//! Each tool has a typed argument struct deserialized from the model's
//! JSON plus a `validate` step that normalizes defaults and enforces the
//! contract. Validation failures come back as [`ToolError`]s with a
//! suggestion the model can act on.

use serde::Deserialize;

use crate::tool::ToolError;

fn parse<'a, T: Deserialize<'a>>(raw: &'a str) -> Result<T, ToolError> {
    serde_json::from_str(raw).map_err(|e| {
        ToolError::new(
            format!("invalid arguments: {e}"),
            "send a JSON object matching the tool's parameter schema",
        )
    })
}

// ---------------------------------------------------------------------------
// task.current.set_flag
// ---------------------------------------------------------------------------

pub const FLAG_VALUES: &[&str] = &["success", "notify", "error"];

#[derive(Debug, Clone, Deserialize)]
pub struct SetFlagArgs {
    pub flag: String,
    pub status_message: String,
}

impl SetFlagArgs {
    pub fn parse_and_validate(raw: &str) -> Result<Self, ToolError> {
        let args: Self = parse(raw)?;
        if !FLAG_VALUES.contains(&args.flag.as_str()) {
            return Err(ToolError::new(
                format!("invalid flag: {}", args.flag),
                "use one of: success, notify, error",
            ));
        }
        if args.status_message.trim().is_empty() {
            return Err(ToolError::new(
                "status_message must not be empty",
                "describe the outcome in status_message",
            ));
        }
        Ok(args)
    }
}

// ---------------------------------------------------------------------------
// write_stdin
// ---------------------------------------------------------------------------

pub const WRITE_STDIN_TIMEOUT_MIN_MS: u64 = 100;
pub const WRITE_STDIN_TIMEOUT_MAX_MS: u64 = 15_000;
pub const WRITE_STDIN_TIMEOUT_DEFAULT_MS: u64 = 1_800;

#[derive(Debug, Clone, Deserialize)]
pub struct WriteStdinArgs {
    pub input: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WriteStdinArgs {
    /// Validate; `raw_shell_mode` enables the unsubmitted-command check
    /// (active when the allowlist has `exec_command` but not
    /// `task.input_prompt`).
    pub fn parse_and_validate(raw: &str, raw_shell_mode: bool) -> Result<ValidWriteStdin, ToolError> {
        let args: Self = parse(raw)?;
        if args.input.is_empty() {
            return Err(ToolError::new(
                "input must not be empty",
                "provide the bytes to write to the pane's stdin",
            ));
        }
        let timeout_ms = args.timeout_ms.unwrap_or(WRITE_STDIN_TIMEOUT_DEFAULT_MS);
        if !(WRITE_STDIN_TIMEOUT_MIN_MS..=WRITE_STDIN_TIMEOUT_MAX_MS).contains(&timeout_ms) {
            return Err(ToolError::new(
                format!("timeout_ms out of range: {timeout_ms}"),
                "use a timeout between 100 and 15000 milliseconds",
            ));
        }
        if raw_shell_mode && is_complete_shell_command(&args.input) {
            return Err(ToolError::new(
                "input looks like a complete shell command with no submit character",
                "append \\r to run the command, or use exec_command instead",
            ));
        }
        Ok(ValidWriteStdin {
            input: args.input,
            timeout_ms,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidWriteStdin {
    pub input: String,
    pub timeout_ms: u64,
}

/// Command tokens the completeness heuristic opts out of: wrappers and
/// path fragments that do not stand alone as a finished command line.
const INCOMPLETE_PREFIX_TOKENS: &[&str] =
    &["/", "sudo", "env", "command", "builtin", "time", "nohup"];

/// Heuristic for "a finished shell command that the model forgot to
/// submit". True means: no submit/control characters, balanced quoting
/// and bracketing, no trailing continuation or operator, and a first
/// non-assignment token outside the opt-out list.
pub fn is_complete_shell_command(input: &str) -> bool {
    if input
        .chars()
        .any(|c| matches!(c, '\r' | '\n' | '\t' | '\u{1b}'))
    {
        return false;
    }
    if !is_balanced(input) {
        return false;
    }
    let trimmed = input.trim_end_matches(' ');
    if trimmed.is_empty() || trimmed.ends_with('\\') {
        return false;
    }
    for op in ["&&", "||", "|", ";", "&", "<", ">"] {
        if trimmed.ends_with(op) {
            return false;
        }
    }

    let first = trimmed
        .split(' ')
        .filter(|tok| !tok.is_empty())
        .find(|tok| !is_env_assignment(tok));
    let Some(first) = first else {
        return false;
    };
    !INCOMPLETE_PREFIX_TOKENS.contains(&first)
}

fn is_env_assignment(tok: &str) -> bool {
    let Some(eq) = tok.find('=') else {
        return false;
    };
    let name = &tok[..eq];
    !name.is_empty()
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
}

/// Balanced quotes and brackets with shell-ish escaping rules: single
/// quotes are literal, double quotes allow backslash escapes, backslash
/// escapes the next character outside single quotes.
fn is_balanced(input: &str) -> bool {
    let mut stack: Vec<char> = Vec::new();
    let mut chars = input.chars();
    let mut in_single = false;
    let mut in_double = false;
    while let Some(c) = chars.next() {
        if in_single {
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        if c == '\\' {
            // Consumes the escaped character (if any).
            let _ = chars.next();
            continue;
        }
        if in_double {
            if c == '"' {
                in_double = false;
            }
            continue;
        }
        match c {
            '\'' => in_single = true,
            '"' => in_double = true,
            '(' | '[' | '{' => stack.push(c),
            ')' => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty() && !in_single && !in_double
}

// ---------------------------------------------------------------------------
// exec_command
// ---------------------------------------------------------------------------

pub const EXEC_TOKENS_MIN: u32 = 128;
pub const EXEC_TOKENS_MAX: u32 = 8_000;
pub const EXEC_TOKENS_DEFAULT: u32 = 1_200;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecCommandArgs {
    pub command: String,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

impl ExecCommandArgs {
    pub fn parse_and_validate(raw: &str) -> Result<(String, u32), ToolError> {
        let args: Self = parse(raw)?;
        if args.command.trim().is_empty() {
            return Err(ToolError::new(
                "command must not be empty",
                "provide the shell command to execute",
            ));
        }
        let tokens = args.max_output_tokens.unwrap_or(EXEC_TOKENS_DEFAULT);
        if !(EXEC_TOKENS_MIN..=EXEC_TOKENS_MAX).contains(&tokens) {
            return Err(ToolError::new(
                format!("max_output_tokens out of range: {tokens}"),
                "use a value between 128 and 8000",
            ));
        }
        Ok((args.command, tokens))
    }
}

// ---------------------------------------------------------------------------
// readfile
// ---------------------------------------------------------------------------

pub const READFILE_CHARS_MIN: u32 = 128;
pub const READFILE_CHARS_MAX: u32 = 200_000;
pub const READFILE_CHARS_DEFAULT: u32 = 24_000;

#[derive(Debug, Clone, Deserialize)]
pub struct ReadfileArgs {
    pub path: String,
    #[serde(default)]
    pub max_chars: Option<u32>,
}

impl ReadfileArgs {
    pub fn parse_and_validate(raw: &str) -> Result<(String, u32), ToolError> {
        let args: Self = parse(raw)?;
        if args.path.trim().is_empty() {
            return Err(ToolError::new(
                "path must not be empty",
                "provide the file path to read",
            ));
        }
        let chars = args.max_chars.unwrap_or(READFILE_CHARS_DEFAULT);
        if !(READFILE_CHARS_MIN..=READFILE_CHARS_MAX).contains(&chars) {
            return Err(ToolError::new(
                format!("max_chars out of range: {chars}"),
                "use a value between 128 and 200000",
            ));
        }
        Ok((args.path, chars))
    }
}

// ---------------------------------------------------------------------------
// task.input_prompt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct InputPromptArgs {
    pub prompt: String,
}

impl InputPromptArgs {
    /// Validate and normalize: only spaces/tabs are trimmed, and a
    /// carriage return is appended unless the prompt already submits
    /// itself.
    pub fn parse_and_validate(raw: &str) -> Result<String, ToolError> {
        let args: Self = parse(raw)?;
        let trimmed = args.prompt.trim_matches([' ', '\t']);
        if trimmed.is_empty() {
            return Err(ToolError::new(
                "prompt must not be empty",
                "provide the text to send to the task's pane",
            ));
        }
        let mut prompt = trimmed.to_owned();
        if !prompt.ends_with('\r') && !prompt.ends_with('\n') {
            prompt.push('\r');
        }
        Ok(prompt)
    }
}

// ---------------------------------------------------------------------------
// task.child.* and task.parent.report
// ---------------------------------------------------------------------------

pub const TASK_ROLES: &[&str] = &["executor"];

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnChildArgs {
    pub command: String,
    pub title: String,
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub task_role: Option<String>,
}

impl SpawnChildArgs {
    pub fn parse_and_validate(raw: &str) -> Result<Self, ToolError> {
        let args: Self = parse(raw)?;
        for (field, value) in [
            ("command", &args.command),
            ("title", &args.title),
            ("description", &args.description),
            ("prompt", &args.prompt),
        ] {
            if value.trim().is_empty() {
                return Err(ToolError::new(
                    format!("{field} must not be empty"),
                    format!("provide a non-empty {field} for the child task"),
                ));
            }
        }
        if let Some(role) = &args.task_role {
            if !TASK_ROLES.contains(&role.as_str()) {
                return Err(ToolError::new(
                    format!("invalid task_role: {role}"),
                    "use one of: executor",
                ));
            }
        }
        Ok(args)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildIdArgs {
    pub child_task_id: String,
}

impl ChildIdArgs {
    pub fn parse_and_validate(raw: &str) -> Result<String, ToolError> {
        let args: Self = parse(raw)?;
        if args.child_task_id.trim().is_empty() {
            return Err(ToolError::new(
                "child_task_id must not be empty",
                "pass the id returned by task.child.spawn",
            ));
        }
        Ok(args.child_task_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtyOutputArgs {
    pub child_task_id: String,
    #[serde(default)]
    pub offset: i64,
}

impl TtyOutputArgs {
    pub fn parse_and_validate(raw: &str) -> Result<(String, u64), ToolError> {
        let args: Self = parse(raw)?;
        if args.child_task_id.trim().is_empty() {
            return Err(ToolError::new(
                "child_task_id must not be empty",
                "pass the id returned by task.child.spawn",
            ));
        }
        if args.offset < 0 {
            return Err(ToolError::new(
                format!("offset must be >= 0, got {}", args.offset),
                "use a non-negative byte offset",
            ));
        }
        Ok((args.child_task_id, args.offset as u64))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageArgs {
    pub child_task_id: String,
    pub message: String,
}

impl SendMessageArgs {
    pub fn parse_and_validate(raw: &str) -> Result<Self, ToolError> {
        let args: Self = parse(raw)?;
        if args.child_task_id.trim().is_empty() || args.message.trim().is_empty() {
            return Err(ToolError::new(
                "child_task_id and message must not be empty",
                "pass the child id and a non-empty message",
            ));
        }
        Ok(args)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParentReportArgs {
    pub message: String,
}

impl ParentReportArgs {
    pub fn parse_and_validate(raw: &str) -> Result<String, ToolError> {
        let args: Self = parse(raw)?;
        if args.message.trim().is_empty() {
            return Err(ToolError::new(
                "message must not be empty",
                "describe the progress to report to the parent task",
            ));
        }
        Ok(args.message)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

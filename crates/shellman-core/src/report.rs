//! Task-state report and persisted runtime baseline types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::PaneStatus;

/// Seed for a freshly started pane state machine, loaded from the store so
/// status and activity timestamps survive a daemon restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneRuntimeBaseline {
    pub last_active_at: Option<DateTime<Utc>>,
    pub runtime_status: PaneStatus,
    pub snapshot_hash: String,
}

/// One pane's runtime state as reported to the task-state actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateReport {
    pub pane_id: String,
    pub pane_target: String,
    pub current_command: String,
    pub runtime_status: PaneStatus,
    pub snapshot: String,
    pub snapshot_hash: String,
    pub cursor_x: u32,
    pub cursor_y: u32,
    pub has_cursor: bool,
    pub updated_at: DateTime<Utc>,
}

/// Keep only the last `max_lines` lines of a snapshot.
pub fn trim_snapshot(text: &str, max_lines: usize) -> &str {
    if max_lines == 0 {
        return "";
    }
    let mut newlines = 0usize;
    for (idx, b) in text.bytes().enumerate().rev() {
        if b != b'\n' {
            continue;
        }
        // A trailing newline terminates a line rather than opening one.
        if idx == text.len() - 1 {
            continue;
        }
        newlines += 1;
        if newlines == max_lines {
            return &text[idx + 1..];
        }
    }
    text
}

/// Whether two reports carry the same pane content. Reports that compare
/// equal here must not dirty the task-state actor.
pub fn same_pane_content(a: &TaskStateReport, b: &TaskStateReport) -> bool {
    a.snapshot == b.snapshot
        && a.runtime_status == b.runtime_status
        && a.current_command == b.current_command
        && a.cursor_x == b.cursor_x
        && a.cursor_y == b.cursor_y
        && a.has_cursor == b.has_cursor
        && a.snapshot_hash == b.snapshot_hash
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Project-wide status snapshot items and chunked `tmux.status` events.
//!
//! The status pump serializes one item per pane; when the probe-serialized
//! payload would exceed the frame budget, items are packed greedily into
//! multiple full-mode events tagged `chunk_index`/`chunk_total`. An item
//! that alone exceeds the budget still goes out, alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::MAX_FRAME_BYTES;
use crate::status::PaneStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusItem {
    pub target: String,
    pub title: String,
    pub current_command: String,
    pub status: PaneStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
}

/// One `tmux.status{mode:"full"}` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxStatusFull {
    pub mode: String,
    pub items: Vec<SessionStatusItem>,
    pub chunk_index: usize,
    pub chunk_total: usize,
}

/// Pack items into full-mode status payloads no larger than `limit` bytes
/// of serialized items (the default budget is [`MAX_FRAME_BYTES`]).
pub fn build_status_messages(items: Vec<SessionStatusItem>, limit: usize) -> Vec<TmuxStatusFull> {
    let mut groups: Vec<Vec<SessionStatusItem>> = Vec::new();
    let mut current: Vec<SessionStatusItem> = Vec::new();
    let mut current_size = 0usize;

    for item in items {
        let size = serde_json::to_string(&item).map(|s| s.len()).unwrap_or(0);
        if !current.is_empty() && current_size + size > limit {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(item);
        // An oversized single item occupies its own chunk.
        if current_size > limit {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    if groups.is_empty() {
        groups.push(Vec::new());
    }

    let total = groups.len();
    groups
        .into_iter()
        .enumerate()
        .map(|(idx, items)| TmuxStatusFull {
            mode: "full".to_owned(),
            items,
            chunk_index: idx,
            chunk_total: total,
        })
        .collect()
}

/// Default-budget convenience wrapper.
pub fn build_status_messages_default(items: Vec<SessionStatusItem>) -> Vec<TmuxStatusFull> {
    build_status_messages(items, MAX_FRAME_BYTES)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

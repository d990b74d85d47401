//! Stream differ and frame chunker.
//!
//! Each pane tick compares the previous and current snapshot and decides
//! how to bring the client's terminal up to date without a protocol-level
//! reset: a pure suffix when the snapshot grew in place, or an in-band
//! repaint when it diverged. Oversized frames are split on UTF-8
//! boundaries so every chunk remains a valid text frame.

use crate::protocol::FrameMode;

/// Clears the client terminal in-band: SGR reset, home, erase display.
pub const REPAINT_PREFIX: &str = "\u{1b}[0m\u{1b}[H\u{1b}[2J";

/// Maximum serialized payload size for one `term.output` frame.
pub const MAX_FRAME_BYTES: usize = 24 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub mode: FrameMode,
    pub data: String,
}

/// Decide the frame for one tick.
///
/// `snapshot_changed` is false when only the cursor moved; the frame is
/// then an empty append that carries the fresh cursor. When `curr` starts
/// with `prev` the suffix alone is appended. Otherwise the full snapshot
/// is sent behind [`REPAINT_PREFIX`] so the client redraws without a
/// `reset` frame.
pub fn decide_delta(prev: &str, curr: &str, snapshot_changed: bool) -> Delta {
    if !snapshot_changed {
        return Delta {
            mode: FrameMode::Append,
            data: String::new(),
        };
    }

    if curr.starts_with(prev) {
        return Delta {
            mode: FrameMode::Append,
            data: curr[prev.len()..].to_owned(),
        };
    }

    let mut data = String::with_capacity(REPAINT_PREFIX.len() + curr.len());
    data.push_str(REPAINT_PREFIX);
    data.push_str(curr);
    Delta {
        mode: FrameMode::Append,
        data,
    }
}

/// Split a frame into chunks of at most `limit` bytes.
///
/// The first chunk keeps the original mode; every later chunk is forced to
/// `append` so the client never re-resets mid-frame. Split points back up
/// until the prefix is valid UTF-8, advancing at least one byte.
pub fn split_frame(mode: FrameMode, data: &str, limit: usize) -> Vec<Delta> {
    if data.len() <= limit {
        return vec![Delta {
            mode,
            data: data.to_owned(),
        }];
    }

    let mut chunks = Vec::new();
    let mut rest = data;
    let mut first = true;
    while !rest.is_empty() {
        let mut size = limit.min(rest.len());
        while size > 0 && !rest.is_char_boundary(size) {
            size -= 1;
        }
        if size == 0 {
            // The leading rune alone exceeds the limit; emit it whole so the
            // chunk stays valid UTF-8 and the loop makes progress.
            size = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(size);
        chunks.push(Delta {
            mode: if first { mode } else { FrameMode::Append },
            data: head.to_owned(),
        });
        first = false;
        rest = tail;
    }
    chunks
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Conn actor: one logical client connection on the shared socket.
//!
//! Owns a bounded outbound queue with a class-aware drop policy and the
//! conn's pane selection state (current target, monotonic selection
//! version, bounded watch list with LRU eviction). A dedicated writer
//! task drains the queue, wraps each message in a mux envelope, and
//! writes it to the shared peer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use shellman_core::protocol::{encode_envelope, Cursor, FrameMode, Msg, TermOutput, EV_TERM_OUTPUT};

use crate::mux::FrameSink;

/// Outbound queue capacity per conn.
pub const OUTBOUND_CAPACITY: usize = 128;

/// Default simultaneous watched panes per conn.
pub const DEFAULT_WATCH_LIMIT: usize = 5;

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

/// Drop class. Append frames are incremental and safe to shed under
/// backpressure; everything else (reset, pane.ended, responses, status)
/// must make it out if at all possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Append,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub msg: Msg,
    pub class: FrameClass,
}

impl Outbound {
    pub fn term_output(target: &str, mode: FrameMode, data: String, cursor: Option<Cursor>) -> Self {
        let payload = TermOutput {
            target: target.to_owned(),
            mode,
            data,
            cursor,
        };
        let class = match mode {
            FrameMode::Append => FrameClass::Append,
            FrameMode::Reset => FrameClass::Critical,
        };
        Self {
            msg: Msg::event(
                EV_TERM_OUTPUT,
                serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            ),
            class,
        }
    }

    pub fn event(op: &str, payload: serde_json::Value) -> Self {
        Self {
            msg: Msg::event(op, payload),
            class: FrameClass::Critical,
        }
    }

    pub fn response(msg: Msg) -> Self {
        Self {
            msg,
            class: FrameClass::Critical,
        }
    }

    pub fn is_append(&self) -> bool {
        self.class == FrameClass::Append
    }
}

// ---------------------------------------------------------------------------
// ConnActor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Selection {
    target: Option<String>,
    version: u64,
    /// LRU order, oldest first.
    watch: Vec<String>,
}

pub struct ConnActor {
    conn_id: String,
    queue: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    selection: Mutex<Selection>,
}

impl ConnActor {
    pub fn new(conn_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            conn_id: conn_id.into(),
            queue: Mutex::new(VecDeque::with_capacity(OUTBOUND_CAPACITY)),
            notify: Notify::new(),
            selection: Mutex::new(Selection::default()),
        })
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Outbound>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_selection(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue with the class-aware policy. Returns false when the frame
    /// was dropped.
    ///
    /// Full queue: append frames are shed silently; a critical frame
    /// evicts the head if that head is an append, otherwise it is dropped
    /// with a warning.
    pub fn enqueue(&self, out: Outbound) -> bool {
        let mut queue = self.lock_queue();
        if queue.len() < OUTBOUND_CAPACITY {
            queue.push_back(out);
            drop(queue);
            self.notify.notify_one();
            return true;
        }

        if out.is_append() {
            return false;
        }

        if queue.front().is_some_and(Outbound::is_append) {
            queue.pop_front();
            queue.push_back(out);
            drop(queue);
            self.notify.notify_one();
            return true;
        }

        tracing::warn!(
            conn_id = %self.conn_id,
            op = %out.msg.op,
            "conn outbound queue full of critical frames; dropping"
        );
        false
    }

    fn drain(&self) -> Vec<Outbound> {
        let mut queue = self.lock_queue();
        queue.drain(..).collect()
    }

    /// Select `target` and update the watch list. The version increases on
    /// every call, including re-selecting the current target; subscribers
    /// rely on the bump to force a fresh reset frame.
    ///
    /// Returns `(version, previous_target, evicted_target)`.
    pub fn select_and_watch(
        &self,
        target: &str,
        limit: usize,
    ) -> (u64, Option<String>, Option<String>) {
        let mut sel = self.lock_selection();
        sel.version += 1;
        let previous = sel.target.replace(target.to_owned());

        sel.watch.retain(|t| t != target);
        sel.watch.push(target.to_owned());
        let evicted = if sel.watch.len() > limit {
            Some(sel.watch.remove(0))
        } else {
            None
        };

        (sel.version, previous, evicted)
    }

    pub fn selected_target(&self) -> Option<String> {
        self.lock_selection().target.clone()
    }

    pub fn selection_version(&self) -> u64 {
        self.lock_selection().version
    }

    pub fn watched(&self) -> Vec<String> {
        self.lock_selection().watch.clone()
    }

    pub fn drop_watch(&self, target: &str) {
        let mut sel = self.lock_selection();
        sel.watch.retain(|t| t != target);
        if sel.target.as_deref() == Some(target) {
            sel.target = None;
        }
    }
}

#[cfg(test)]
impl ConnActor {
    /// Pop everything off the queue; shared by actor tests.
    pub(crate) fn test_drain(&self) -> Vec<Msg> {
        self.drain().into_iter().map(|o| o.msg).collect()
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Drain the conn's queue onto the shared peer until cancelled. Write
/// failures are logged with enough context to trace the lost envelope;
/// the actor itself stays alive.
pub async fn run_conn_writer(
    conn: Arc<ConnActor>,
    sink: Arc<dyn FrameSink>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = conn.notify.notified() => {}
            _ = cancel.cancelled() => return,
        }

        for out in conn.drain() {
            let inner = match serde_json::to_string(&out.msg) {
                Ok(inner) => inner,
                Err(e) => {
                    tracing::warn!(conn_id = %conn.conn_id, error = %e, "conn writer: encode failed");
                    continue;
                }
            };
            let frame = match encode_envelope(&conn.conn_id, &inner) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(conn_id = %conn.conn_id, error = %e, "conn writer: envelope failed");
                    continue;
                }
            };
            if let Err(e) = sink.send(frame).await {
                let (target, mode, data_len) = describe_term_output(&out.msg);
                tracing::warn!(
                    conn_id = %conn.conn_id,
                    op = %out.msg.op,
                    target = %target,
                    mode = %mode,
                    data_len,
                    error = %e,
                    "conn writer: send failed, envelope lost"
                );
            }
        }
    }
}

fn describe_term_output(msg: &Msg) -> (String, String, usize) {
    let target = msg
        .payload
        .get("target")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned();
    let mode = msg
        .payload
        .get("mode")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned();
    let data_len = msg
        .payload
        .get("data")
        .and_then(|v| v.as_str())
        .map_or(0, str::len);
    (target, mode, data_len)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::CollectingSink;
    use shellman_core::protocol::decode_envelope;

    fn append(target: &str, data: &str) -> Outbound {
        Outbound::term_output(target, FrameMode::Append, data.into(), None)
    }

    fn reset(target: &str, data: &str) -> Outbound {
        Outbound::term_output(target, FrameMode::Reset, data.into(), None)
    }

    #[test]
    fn enqueue_under_capacity_accepts_everything() {
        let conn = ConnActor::new("conn_1");
        assert!(conn.enqueue(append("a:0.0", "x")));
        assert!(conn.enqueue(reset("a:0.0", "y")));
        assert_eq!(conn.lock_queue().len(), 2);
    }

    #[test]
    fn full_queue_sheds_appends_silently() {
        let conn = ConnActor::new("conn_1");
        for _ in 0..OUTBOUND_CAPACITY {
            assert!(conn.enqueue(append("a:0.0", "x")));
        }
        assert!(!conn.enqueue(append("a:0.0", "overflow")));
        assert_eq!(conn.lock_queue().len(), OUTBOUND_CAPACITY);
    }

    #[test]
    fn critical_evicts_append_head() {
        let conn = ConnActor::new("conn_1");
        for _ in 0..OUTBOUND_CAPACITY {
            conn.enqueue(append("a:0.0", "x"));
        }
        assert!(conn.enqueue(reset("a:0.0", "fresh")));
        let queue = conn.lock_queue();
        assert_eq!(queue.len(), OUTBOUND_CAPACITY);
        assert!(queue.back().is_some_and(|o| !o.is_append()));
    }

    #[test]
    fn critical_head_blocks_eviction() {
        let conn = ConnActor::new("conn_1");
        conn.enqueue(reset("a:0.0", "head"));
        for _ in 0..OUTBOUND_CAPACITY - 1 {
            conn.enqueue(append("a:0.0", "x"));
        }
        // Head is critical: the new critical frame is dropped, head stays.
        assert!(!conn.enqueue(reset("a:0.0", "late")));
        let queue = conn.lock_queue();
        assert!(queue.front().is_some_and(|o| !o.is_append()));
        assert_eq!(queue.len(), OUTBOUND_CAPACITY);
    }

    #[test]
    fn select_version_strictly_increases_even_for_same_target() {
        let conn = ConnActor::new("conn_1");
        let (v1, prev1, _) = conn.select_and_watch("a:0.0", DEFAULT_WATCH_LIMIT);
        let (v2, prev2, _) = conn.select_and_watch("a:0.0", DEFAULT_WATCH_LIMIT);
        assert!(v2 > v1);
        assert_eq!(prev1, None);
        assert_eq!(prev2.as_deref(), Some("a:0.0"));
    }

    #[test]
    fn watch_list_evicts_lru_and_moves_reselected_to_back() {
        let conn = ConnActor::new("conn_1");
        for i in 0..5 {
            let (_, _, evicted) = conn.select_and_watch(&format!("a:0.{i}"), 5);
            assert_eq!(evicted, None);
        }
        // Re-select the oldest; it moves to the back instead of growing.
        let (_, _, evicted) = conn.select_and_watch("a:0.0", 5);
        assert_eq!(evicted, None);
        // A sixth distinct target evicts the now-oldest a:0.1.
        let (_, _, evicted) = conn.select_and_watch("a:0.5", 5);
        assert_eq!(evicted.as_deref(), Some("a:0.1"));
        assert_eq!(conn.watched().len(), 5);
    }

    #[tokio::test]
    async fn writer_wraps_frames_in_envelopes() {
        let conn = ConnActor::new("conn_7");
        let sink = CollectingSink::new();
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_conn_writer(
            Arc::clone(&conn),
            sink.clone() as Arc<dyn FrameSink>,
            cancel.clone(),
        ));

        conn.enqueue(reset("a:0.0", "hello"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        let (conn_id, inner) = decode_envelope(&frames[0]).unwrap();
        assert_eq!(conn_id, "conn_7");
        let msg: Msg = serde_json::from_str(&inner).unwrap();
        assert_eq!(msg.op, EV_TERM_OUTPUT);

        cancel.cancel();
        let _ = writer.await;
    }
}

//! Pane actor: owns one tmux pane target.
//!
//! A periodic tick captures the pane, derives a frame for subscribers
//! (unless the realtime control-mode path is active), advances the status
//! state machine, fires the auto-completion executor on armed
//! running→ready edges, and reports task state at most once per second.
//!
//! Subscribe emits exactly one reset frame to the new conn before any
//! append can reach it: the reset is enqueued synchronously before the
//! realtime subscription is started, and within one conn the outbound
//! queue preserves order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shellman_core::diff::{decide_delta, split_frame, MAX_FRAME_BYTES};
use shellman_core::hash::snapshot_hash;
use shellman_core::input::InputTracker;
use shellman_core::protocol::{Cursor, FrameMode, EV_PANE_ENDED};
use shellman_core::report::{PaneRuntimeBaseline, TaskStateReport};
use shellman_core::status::{StatusFsm, StatusFsmOptions};
use shellman_tmux::{ControlModeHub, CursorPos, TmuxFacade};

use crate::conn::{ConnActor, Outbound};

// ---------------------------------------------------------------------------
// Options and collaborator traits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PaneActorOptions {
    /// Capture/status tick period.
    pub tick_interval: Duration,
    /// Lines of scrollback for gap-recovery snapshots.
    pub history_lines: u32,
    pub fsm: StatusFsmOptions,
    /// Minimum spacing between task-state reports.
    pub report_interval: Duration,
}

impl Default for PaneActorOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            history_lines: 2000,
            fsm: StatusFsmOptions::default(),
            report_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Capture scrollback history instead of the visible screen, for
    /// clients recovering from a gap.
    pub gap_recover: bool,
}

/// Invoked on an armed running→ready edge, at most once per edge.
#[async_trait]
pub trait AutoCompleteExecutor: Send + Sync {
    async fn on_ready_edge(&self, target: &str, observed_last_active_at: Option<DateTime<Utc>>);
}

// ---------------------------------------------------------------------------
// PaneActor
// ---------------------------------------------------------------------------

struct RealtimeSub {
    cancel: CancellationToken,
}

struct PaneState {
    pane_id: String,
    last_snapshot: String,
    last_cursor: Option<CursorPos>,
    fsm: StatusFsm,
    subscribers: HashMap<String, Arc<ConnActor>>,
    realtime: Option<RealtimeSub>,
    last_report_at: Option<DateTime<Utc>>,
    /// Hash whose next auto-progress a caller already consumed.
    consumed_auto: Option<String>,
    ended: bool,
}

pub struct PaneActor {
    target: String,
    tmux: Arc<dyn TmuxFacade>,
    hub: Option<Arc<ControlModeHub>>,
    executor: Option<Arc<dyn AutoCompleteExecutor>>,
    report_tx: Option<mpsc::UnboundedSender<TaskStateReport>>,
    input_tracker: Arc<Mutex<InputTracker>>,
    /// Tells the registry the pane ended so the map entry is dropped.
    on_ended: Option<mpsc::UnboundedSender<String>>,
    opts: PaneActorOptions,
    cancel: CancellationToken,
    started: AtomicBool,
    state: Mutex<PaneState>,
}

pub struct PaneActorDeps {
    pub tmux: Arc<dyn TmuxFacade>,
    pub hub: Option<Arc<ControlModeHub>>,
    pub executor: Option<Arc<dyn AutoCompleteExecutor>>,
    pub report_tx: Option<mpsc::UnboundedSender<TaskStateReport>>,
    pub input_tracker: Arc<Mutex<InputTracker>>,
    pub on_ended: Option<mpsc::UnboundedSender<String>>,
}

impl PaneActor {
    pub fn new(
        target: impl Into<String>,
        deps: PaneActorDeps,
        opts: PaneActorOptions,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let fsm = StatusFsm::new(opts.fsm.clone());
        Arc::new(Self {
            target: target.into(),
            tmux: deps.tmux,
            hub: deps.hub,
            executor: deps.executor,
            report_tx: deps.report_tx,
            input_tracker: deps.input_tracker,
            on_ended: deps.on_ended,
            opts,
            cancel,
            started: AtomicBool::new(false),
            state: Mutex::new(PaneState {
                pane_id: String::new(),
                last_snapshot: String::new(),
                last_cursor: None,
                fsm,
                subscribers: HashMap::new(),
                realtime: None,
                last_report_at: None,
                consumed_auto: None,
                ended: false,
            }),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn lock(&self) -> MutexGuard<'_, PaneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_pane_id(&self, pane_id: &str) {
        self.lock().pane_id = pane_id.to_owned();
    }

    /// Seed the status FSM from a persisted baseline (before first tick).
    pub fn seed_baseline(&self, baseline: &PaneRuntimeBaseline) {
        self.lock().fsm.seed(baseline);
    }

    /// Suppress the next auto-progress for this snapshot hash; used by
    /// callers that already acted on the pane becoming ready.
    pub fn consume_next_auto_progress(&self, hash: &str) {
        self.lock().consumed_auto = Some(hash.to_owned());
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Start the background tick loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let actor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(actor.opts.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so a
            // subscribe-triggered reset stays the first frame a conn sees.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !actor.tick().await {
                            break;
                        }
                    }
                    _ = actor.cancel.cancelled() => break,
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Subscribe / unsubscribe
    // ------------------------------------------------------------------

    /// Attach a conn. Emits exactly one reset frame (snapshot + cursor)
    /// to that conn before any append frames, then lazily starts the
    /// realtime subscription.
    pub async fn subscribe(self: &Arc<Self>, conn: Arc<ConnActor>, opts: SubscribeOptions) {
        let snapshot = if opts.gap_recover {
            self.tmux
                .capture_history(&self.target, self.opts.history_lines)
                .await
        } else {
            self.tmux.capture_pane(&self.target).await
        };
        let snapshot = match snapshot {
            Ok(s) => s,
            Err(e) if e.is_pane_missing() => {
                conn.enqueue(pane_ended_frame(&self.target, "pane missing"));
                return;
            }
            Err(e) => {
                tracing::warn!(target = %self.target, error = %e, "subscribe capture failed; sending empty baseline");
                String::new()
            }
        };
        let cursor = self
            .tmux
            .cursor_position(&self.target)
            .await
            .ok()
            .flatten();

        let start_realtime = {
            let mut st = self.lock();
            if st.ended {
                conn.enqueue(pane_ended_frame(&self.target, "pane missing"));
                return;
            }
            enqueue_frames(
                &self.target,
                FrameMode::Reset,
                &snapshot,
                cursor,
                std::iter::once(&conn),
            );
            st.subscribers.insert(conn.conn_id().to_owned(), conn);
            st.last_snapshot = snapshot;
            st.last_cursor = cursor;
            st.realtime.is_none() && self.hub.is_some()
        };

        if start_realtime {
            self.ensure_realtime_subscribed().await;
        }
    }

    pub fn unsubscribe(&self, conn_id: &str) {
        let mut st = self.lock();
        st.subscribers.remove(conn_id);
        if st.subscribers.is_empty() {
            if let Some(rt) = st.realtime.take() {
                rt.cancel.cancel();
            }
        }
    }

    async fn ensure_realtime_subscribed(self: &Arc<Self>) {
        let Some(hub) = &self.hub else { return };
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = match hub.subscribe(&self.target, tx).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(target = %self.target, error = %e, "realtime subscribe failed; tick diffs remain active");
                return;
            }
        };

        let rt_cancel = self.cancel.child_token();
        let lost_race = {
            let mut st = self.lock();
            if st.realtime.is_some() || st.subscribers.is_empty() {
                // Lost the race or everyone left while we subscribed.
                true
            } else {
                st.realtime = Some(RealtimeSub {
                    cancel: rt_cancel.clone(),
                });
                false
            }
        };
        if lost_race {
            hub.unsubscribe(sub).await;
            return;
        }

        let actor = Arc::clone(self);
        let hub = Arc::clone(hub);
        tokio::spawn(async move {
            let mut rx = rx;
            loop {
                tokio::select! {
                    data = rx.recv() => match data {
                        Some(bytes) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            actor.broadcast_append(&text, None);
                        }
                        None => break,
                    },
                    _ = rt_cancel.cancelled() => break,
                }
            }
            hub.unsubscribe(sub).await;
        });
    }

    /// Fan an append frame out to every subscriber.
    fn broadcast_append(&self, data: &str, cursor: Option<CursorPos>) {
        let mut st = self.lock();
        if st.subscribers.is_empty() {
            return;
        }
        st.last_snapshot.push_str(data);
        enqueue_frames(
            &self.target,
            FrameMode::Append,
            data,
            cursor,
            st.subscribers.values(),
        );
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// One capture/status cycle. Returns false when the pane ended.
    pub(crate) async fn tick(self: &Arc<Self>) -> bool {
        let capture = match self.tmux.capture_pane(&self.target).await {
            Ok(c) => c,
            Err(e) if e.is_pane_missing() => {
                self.finish_ended("pane missing");
                return false;
            }
            Err(e) => {
                tracing::debug!(target = %self.target, error = %e, "capture failed; skipping tick");
                return true;
            }
        };
        let cursor = self
            .tmux
            .cursor_position(&self.target)
            .await
            .ok()
            .flatten();

        let now = Utc::now();
        let last_input = {
            let tracker = self.input_tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.last(&self.target)
        };

        let hash = snapshot_hash(&capture);
        let (auto_fire, report_due, status, last_active_at) = {
            let mut st = self.lock();

            let snapshot_changed = capture != st.last_snapshot;
            let cursor_changed = cursor != st.last_cursor;
            // The realtime path carries appends while it is active; the
            // tick then only drives status and task-state reporting.
            if !st.subscribers.is_empty()
                && st.realtime.is_none()
                && (snapshot_changed || cursor_changed)
            {
                let delta = decide_delta(&st.last_snapshot, &capture, snapshot_changed);
                enqueue_frames(
                    &self.target,
                    delta.mode,
                    &delta.data,
                    cursor,
                    st.subscribers.values(),
                );
            }
            st.last_snapshot = capture.clone();
            st.last_cursor = cursor;

            let tick = st.fsm.tick(&hash, now, last_input);

            let mut auto_fire = None;
            if tick.ready_edge && st.fsm.is_armed() {
                if st.consumed_auto.as_deref() == Some(hash.as_str()) {
                    st.consumed_auto = None;
                } else {
                    auto_fire = Some(tick.last_active_at);
                }
            }

            let report_due = st
                .last_report_at
                .map_or(true, |t| now.signed_duration_since(t) >= report_min(&self.opts));
            if report_due {
                st.last_report_at = Some(now);
            }

            (auto_fire, report_due, tick.status, tick.last_active_at)
        };

        if let Some(observed_last_active_at) = auto_fire {
            if let Some(executor) = &self.executor {
                executor
                    .on_ready_edge(&self.target, observed_last_active_at)
                    .await;
            }
        }

        if report_due {
            if let Some(report_tx) = &self.report_tx {
                let current_command = self
                    .tmux
                    .pane_title_and_current_command(&self.target)
                    .await
                    .map(|(_, cmd)| cmd)
                    .unwrap_or_default();
                let pane_id = self.lock().pane_id.clone();
                let report = TaskStateReport {
                    pane_id,
                    pane_target: self.target.clone(),
                    current_command,
                    runtime_status: status,
                    snapshot: capture,
                    snapshot_hash: hash,
                    cursor_x: cursor.map_or(0, |c| c.x),
                    cursor_y: cursor.map_or(0, |c| c.y),
                    has_cursor: cursor.is_some(),
                    updated_at: last_active_at.unwrap_or(now),
                };
                let _ = report_tx.send(report);
            }
        }

        true
    }

    fn finish_ended(&self, reason: &str) {
        let mut st = self.lock();
        if st.ended {
            return;
        }
        st.ended = true;
        for conn in st.subscribers.values() {
            conn.enqueue(pane_ended_frame(&self.target, reason));
        }
        st.subscribers.clear();
        if let Some(rt) = st.realtime.take() {
            rt.cancel.cancel();
        }
        drop(st);

        tracing::info!(target = %self.target, reason, "pane ended");
        if let Some(on_ended) = &self.on_ended {
            let _ = on_ended.send(self.target.clone());
        }
        self.cancel.cancel();
    }
}

fn report_min(opts: &PaneActorOptions) -> TimeDelta {
    TimeDelta::from_std(opts.report_interval).unwrap_or_else(|_| TimeDelta::seconds(1))
}

fn to_proto_cursor(c: CursorPos) -> Cursor {
    Cursor { x: c.x, y: c.y }
}

fn pane_ended_frame(target: &str, reason: &str) -> Outbound {
    Outbound::event(
        EV_PANE_ENDED,
        serde_json::json!({ "target": target, "reason": reason }),
    )
}

/// Chunk a frame and enqueue it to each conn. Only the first chunk keeps
/// the original mode and carries the cursor.
fn enqueue_frames<'a>(
    target: &str,
    mode: FrameMode,
    data: &str,
    cursor: Option<CursorPos>,
    conns: impl Iterator<Item = &'a Arc<ConnActor>>,
) {
    let chunks = split_frame(mode, data, MAX_FRAME_BYTES);
    let cursor = cursor.map(to_proto_cursor);
    for conn in conns {
        for (idx, chunk) in chunks.iter().enumerate() {
            let chunk_cursor = if idx == 0 { cursor } else { None };
            conn.enqueue(Outbound::term_output(
                target,
                chunk.mode,
                chunk.data.clone(),
                chunk_cursor,
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

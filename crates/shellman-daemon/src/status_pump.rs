//! Status pump: periodic project-wide pane status snapshot.
//!
//! Every tick it probes each listed pane (title, refined current command,
//! snapshot hash), advances a per-pane status state machine seeded from
//! the persisted baseline, and broadcasts one or more full-mode
//! `tmux.status` events, chunked at the frame budget. State for panes
//! that vanished between ticks is deleted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use shellman_core::hash::snapshot_hash;
use shellman_core::input::InputTracker;
use shellman_core::protocol::EV_TMUX_STATUS;
use shellman_core::report::PaneRuntimeBaseline;
use shellman_core::status::{StatusFsm, StatusFsmOptions};
use shellman_core::status_items::{build_status_messages_default, SessionStatusItem};
use shellman_tmux::process::{current_command, read_proc_table, ProcEntry};
use shellman_tmux::TmuxFacade;

use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct StatusPumpOptions {
    pub interval: Duration,
    pub fsm: StatusFsmOptions,
}

impl Default for StatusPumpOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            fsm: StatusFsmOptions::default(),
        }
    }
}

pub struct StatusPump {
    tmux: Arc<dyn TmuxFacade>,
    registry: Arc<Registry>,
    input_tracker: Arc<Mutex<InputTracker>>,
    baselines: HashMap<String, PaneRuntimeBaseline>,
    opts: StatusPumpOptions,
    /// Per-target state machines, owned by the pump task alone.
    fsms: HashMap<String, StatusFsm>,
    /// Overrides the live `/proc` walk in tests.
    proc_table: Option<Vec<ProcEntry>>,
}

impl StatusPump {
    pub fn new(
        tmux: Arc<dyn TmuxFacade>,
        registry: Arc<Registry>,
        input_tracker: Arc<Mutex<InputTracker>>,
        baselines: HashMap<String, PaneRuntimeBaseline>,
        opts: StatusPumpOptions,
    ) -> Self {
        Self {
            tmux,
            registry,
            input_tracker,
            baselines,
            opts,
            fsms: HashMap::new(),
            proc_table: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_proc_table(mut self, table: Vec<ProcEntry>) -> Self {
        self.proc_table = Some(table);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.opts.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick_once().await,
                _ = cancel.cancelled() => break,
            }
        }
        tracing::debug!("status pump stopped");
    }

    pub async fn tick_once(&mut self) {
        let listings = match self.tmux.list_sessions().await {
            Ok(listings) => listings,
            Err(e) => {
                tracing::debug!(error = %e, "status pump: list failed");
                return;
            }
        };
        let table = match &self.proc_table {
            Some(table) => table.clone(),
            None => read_proc_table(),
        };

        let now = Utc::now();
        let mut seen: HashSet<String> = HashSet::with_capacity(listings.len());
        let mut items: Vec<SessionStatusItem> = Vec::with_capacity(listings.len());

        for listing in listings {
            seen.insert(listing.target.clone());

            let (title, tmux_cmd) = self
                .tmux
                .pane_title_and_current_command(&listing.target)
                .await
                .unwrap_or_default();
            let command = current_command(listing.pane_pid, &table).unwrap_or(tmux_cmd);

            let snapshot = match self.tmux.capture_pane(&listing.target).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(target = %listing.target, error = %e, "status pump: capture failed");
                    continue;
                }
            };

            let fsm = self.fsms.entry(listing.target.clone()).or_insert_with(|| {
                let mut fsm = StatusFsm::new(self.opts.fsm.clone());
                if let Some(baseline) = self.baselines.get(&listing.target) {
                    fsm.seed(baseline);
                }
                fsm
            });
            let last_input = {
                let tracker = self.input_tracker.lock().unwrap_or_else(|e| e.into_inner());
                tracker.last(&listing.target)
            };
            let tick = fsm.tick(&snapshot_hash(&snapshot), now, last_input);

            items.push(SessionStatusItem {
                target: listing.target,
                title,
                current_command: command,
                status: tick.status,
                last_active_at: tick.last_active_at,
            });
        }

        // Forget panes that disappeared between ticks.
        let stale: Vec<String> = self
            .fsms
            .keys()
            .filter(|t| !seen.contains(*t))
            .cloned()
            .collect();
        if !stale.is_empty() {
            self.fsms.retain(|target, _| seen.contains(target));
            let mut tracker = self.input_tracker.lock().unwrap_or_else(|e| e.into_inner());
            for target in &stale {
                tracker.remove(target);
            }
        }

        for message in build_status_messages_default(items) {
            match serde_json::to_value(&message) {
                Ok(payload) => self.registry.broadcast_event(EV_TMUX_STATUS, payload),
                Err(e) => tracing::warn!(error = %e, "status pump: encode failed"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnActor;
    use crate::mux::CollectingSink;
    use crate::registry::{RegistryDeps, RegistryOptions};
    use shellman_core::status::PaneStatus;
    use shellman_core::status_items::TmuxStatusFull;
    use shellman_tmux::FakeTmux;

    fn make_registry(tmux: Arc<FakeTmux>) -> Arc<Registry> {
        Registry::new(
            RegistryDeps {
                tmux,
                hub: None,
                executor: None,
                report_tx: None,
                input_tracker: Arc::new(Mutex::new(InputTracker::new())),
                baselines: HashMap::new(),
                sink: CollectingSink::new(),
            },
            RegistryOptions::default(),
            CancellationToken::new(),
        )
    }

    fn status_events(conn: &Arc<ConnActor>) -> Vec<TmuxStatusFull> {
        conn.test_drain()
            .into_iter()
            .filter(|m| m.op == EV_TMUX_STATUS)
            .map(|m| serde_json::from_value(m.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn pump_emits_full_status_for_all_panes() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("s:0.0", "alpha$");
        tmux.add_pane("s:0.1", "beta$");
        tmux.set_title_and_command("s:0.0", "editor", "bash");

        let registry = make_registry(Arc::clone(&tmux));
        let conn = registry.ensure_conn("conn_1");

        let mut pump = StatusPump::new(
            Arc::clone(&tmux) as Arc<dyn TmuxFacade>,
            Arc::clone(&registry),
            Arc::new(Mutex::new(InputTracker::new())),
            HashMap::new(),
            StatusPumpOptions::default(),
        )
        .with_proc_table(vec![]);

        pump.tick_once().await;

        let events = status_events(&conn);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.mode, "full");
        assert_eq!(event.chunk_total, 1);
        assert_eq!(event.items.len(), 2);
        let first = event.items.iter().find(|i| i.target == "s:0.0").unwrap();
        assert_eq!(first.title, "editor");
        assert_eq!(first.current_command, "bash");
        assert_eq!(first.status, PaneStatus::Running, "first sample seeds running");
    }

    #[tokio::test]
    async fn pump_refines_command_from_process_tree() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("s:0.0", "x");
        tmux.set_title_and_command("s:0.0", "", "bash");
        let pane_pid = tmux.list_sessions().await.unwrap()[0].pane_pid;

        let registry = make_registry(Arc::clone(&tmux));
        let conn = registry.ensure_conn("conn_1");

        let table = vec![
            ProcEntry {
                pid: pane_pid,
                ppid: 1,
                comm: "bash".into(),
                args: vec!["bash".into()],
            },
            ProcEntry {
                pid: pane_pid + 1,
                ppid: pane_pid,
                comm: "node".into(),
                args: vec!["node".into(), "server.js".into()],
            },
        ];
        let mut pump = StatusPump::new(
            Arc::clone(&tmux) as Arc<dyn TmuxFacade>,
            Arc::clone(&registry),
            Arc::new(Mutex::new(InputTracker::new())),
            HashMap::new(),
            StatusPumpOptions::default(),
        )
        .with_proc_table(table);

        pump.tick_once().await;
        let events = status_events(&conn);
        assert_eq!(events[0].items[0].current_command, "server");
    }

    #[tokio::test]
    async fn vanished_pane_state_is_deleted() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("s:0.0", "x");
        tmux.add_pane("s:0.1", "y");

        let registry = make_registry(Arc::clone(&tmux));
        let _conn = registry.ensure_conn("conn_1");

        let mut pump = StatusPump::new(
            Arc::clone(&tmux) as Arc<dyn TmuxFacade>,
            Arc::clone(&registry),
            Arc::new(Mutex::new(InputTracker::new())),
            HashMap::new(),
            StatusPumpOptions::default(),
        )
        .with_proc_table(vec![]);

        pump.tick_once().await;
        assert_eq!(pump.fsms.len(), 2);

        tmux.end_pane("s:0.1");
        pump.tick_once().await;
        assert_eq!(pump.fsms.len(), 1);
        assert!(pump.fsms.contains_key("s:0.0"));
    }

    #[tokio::test]
    async fn baseline_seeds_first_pump_sample() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("s:0.0", "prompt$");
        let registry = make_registry(Arc::clone(&tmux));
        let conn = registry.ensure_conn("conn_1");

        let seeded_at = chrono::DateTime::parse_from_rfc3339("2026-02-20T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut baselines = HashMap::new();
        baselines.insert(
            "s:0.0".to_owned(),
            PaneRuntimeBaseline {
                last_active_at: Some(seeded_at),
                runtime_status: PaneStatus::Ready,
                snapshot_hash: "persisted".into(),
            },
        );

        let mut pump = StatusPump::new(
            Arc::clone(&tmux) as Arc<dyn TmuxFacade>,
            Arc::clone(&registry),
            Arc::new(Mutex::new(InputTracker::new())),
            baselines,
            StatusPumpOptions::default(),
        )
        .with_proc_table(vec![]);

        pump.tick_once().await;
        let events = status_events(&conn);
        let item = &events[0].items[0];
        assert_eq!(item.status, PaneStatus::Ready, "seeded status holds");
        assert_eq!(item.last_active_at, Some(seeded_at));
    }
}

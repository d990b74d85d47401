//! Registry actor: process-wide pane and conn bookkeeping.
//!
//! One mutex guards the two maps; it is always released before calling
//! into a pane actor so no two component locks are ever held together.
//! A discovery loop pre-warms pane actors from `list-panes` so status and
//! task-state reporting cover panes no client has selected yet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shellman_core::input::InputTracker;
use shellman_core::report::{PaneRuntimeBaseline, TaskStateReport};
use shellman_tmux::{ControlModeHub, TmuxFacade};

use crate::conn::{run_conn_writer, ConnActor, Outbound, DEFAULT_WATCH_LIMIT};
use crate::mux::FrameSink;
use crate::pane::{
    AutoCompleteExecutor, PaneActor, PaneActorDeps, PaneActorOptions, SubscribeOptions,
};

#[derive(Clone)]
pub struct RegistryOptions {
    pub pane: PaneActorOptions,
    pub watch_limit: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            pane: PaneActorOptions::default(),
            watch_limit: DEFAULT_WATCH_LIMIT,
        }
    }
}

pub struct RegistryDeps {
    pub tmux: Arc<dyn TmuxFacade>,
    pub hub: Option<Arc<ControlModeHub>>,
    pub executor: Option<Arc<dyn AutoCompleteExecutor>>,
    pub report_tx: Option<mpsc::UnboundedSender<TaskStateReport>>,
    pub input_tracker: Arc<Mutex<InputTracker>>,
    /// Persisted runtime baselines keyed by pane target.
    pub baselines: HashMap<String, PaneRuntimeBaseline>,
    pub sink: Arc<dyn FrameSink>,
}

#[derive(Default)]
struct Inner {
    panes: HashMap<String, Arc<PaneActor>>,
    conns: HashMap<String, Arc<ConnActor>>,
}

pub struct Registry {
    inner: Mutex<Inner>,
    deps: RegistryDeps,
    opts: RegistryOptions,
    cancel: CancellationToken,
    ended_tx: mpsc::UnboundedSender<String>,
}

impl Registry {
    pub fn new(deps: RegistryDeps, opts: RegistryOptions, cancel: CancellationToken) -> Arc<Self> {
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<String>();
        let registry = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            deps,
            opts,
            cancel,
            ended_tx,
        });

        // Reaper: a pane that observed its own end is dropped from the
        // map; it is never resurrected within this process lifetime.
        let reaper = Arc::clone(&registry);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ended = ended_rx.recv() => match ended {
                        Some(target) => {
                            reaper.lock().panes.remove(&target);
                            tracing::debug!(target = %target, "registry: dropped ended pane");
                        }
                        None => break,
                    },
                    _ = reaper.cancel.cancelled() => break,
                }
            }
        });

        registry
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Conns
    // ------------------------------------------------------------------

    /// Get or create the conn actor, spawning its writer task on first
    /// appearance of the conn id.
    pub fn ensure_conn(&self, conn_id: &str) -> Arc<ConnActor> {
        let created = {
            let mut inner = self.lock();
            match inner.conns.get(conn_id) {
                Some(conn) => return Arc::clone(conn),
                None => {
                    let conn = ConnActor::new(conn_id);
                    inner.conns.insert(conn_id.to_owned(), Arc::clone(&conn));
                    conn
                }
            }
        };
        tracing::debug!(conn_id, "registry: new conn");
        tokio::spawn(run_conn_writer(
            Arc::clone(&created),
            Arc::clone(&self.deps.sink),
            self.cancel.child_token(),
        ));
        created
    }

    pub fn get_conn(&self, conn_id: &str) -> Option<Arc<ConnActor>> {
        self.lock().conns.get(conn_id).cloned()
    }

    pub fn conns(&self) -> Vec<Arc<ConnActor>> {
        self.lock().conns.values().cloned().collect()
    }

    /// Enqueue an event on every conn (status events are turn-wide).
    pub fn broadcast_event(&self, op: &str, payload: serde_json::Value) {
        for conn in self.conns() {
            conn.enqueue(Outbound::event(op, payload.clone()));
        }
    }

    // ------------------------------------------------------------------
    // Panes
    // ------------------------------------------------------------------

    /// Get or create (and start) the pane actor, applying any persisted
    /// baseline exactly once at creation.
    pub fn ensure_pane(&self, target: &str) -> Arc<PaneActor> {
        let (pane, created) = {
            let mut inner = self.lock();
            match inner.panes.get(target) {
                Some(pane) => (Arc::clone(pane), false),
                None => {
                    let pane = PaneActor::new(
                        target,
                        PaneActorDeps {
                            tmux: Arc::clone(&self.deps.tmux),
                            hub: self.deps.hub.clone(),
                            executor: self.deps.executor.clone(),
                            report_tx: self.deps.report_tx.clone(),
                            input_tracker: Arc::clone(&self.deps.input_tracker),
                            on_ended: Some(self.ended_tx.clone()),
                        },
                        self.opts.pane.clone(),
                        self.cancel.child_token(),
                    );
                    inner.panes.insert(target.to_owned(), Arc::clone(&pane));
                    (pane, true)
                }
            }
        };
        if created {
            if let Some(baseline) = self.deps.baselines.get(target) {
                pane.seed_baseline(baseline);
            }
            pane.start();
            tracing::debug!(target, "registry: new pane actor");
        }
        pane
    }

    pub fn get_pane(&self, target: &str) -> Option<Arc<PaneActor>> {
        self.lock().panes.get(target).cloned()
    }

    pub fn pane_targets(&self) -> Vec<String> {
        self.lock().panes.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Subscribe routing
    // ------------------------------------------------------------------

    /// Route a conn's pane selection: bump the selection version, swap
    /// the previous subscription, honor the watch limit, and attach the
    /// conn to the pane actor (which emits the reset frame).
    pub async fn subscribe(&self, conn_id: &str, target: &str, opts: SubscribeOptions) {
        let conn = self.ensure_conn(conn_id);
        let (version, previous, evicted) = conn.select_and_watch(target, self.opts.watch_limit);
        tracing::debug!(conn_id, target, version, "registry: select pane");

        if let Some(previous) = previous {
            if previous != target {
                if let Some(pane) = self.get_pane(&previous) {
                    pane.unsubscribe(conn_id);
                }
            }
        }
        if let Some(evicted) = evicted {
            if evicted != target {
                tracing::debug!(conn_id, evicted = %evicted, "registry: watch limit eviction");
                if let Some(pane) = self.get_pane(&evicted) {
                    pane.unsubscribe(conn_id);
                }
            }
        }

        let pane = self.ensure_pane(target);
        pane.subscribe(conn, opts).await;
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// One discovery pass: pre-warm pane actors for every listed pane.
    pub async fn discover_once(&self) {
        let listings = match self.deps.tmux.list_sessions().await {
            Ok(listings) => listings,
            Err(e) => {
                tracing::debug!(error = %e, "discovery: list failed");
                return;
            }
        };
        for listing in listings {
            let pane = self.ensure_pane(&listing.target);
            pane.set_pane_id(&listing.pane_id);
        }
    }

    /// Run discovery on the pane tick interval until cancelled.
    pub fn start_discovery(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.opts.pane.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.discover_once().await,
                    _ = registry.cancel.cancelled() => break,
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Task-state actor: persists pane runtime state and emits tree deltas.
//!
//! Pane actors stream [`TaskStateReport`]s in; reports whose content is
//! unchanged do not dirty anything. Each tick flushes the dirty set to
//! the store in one batched transaction (snapshot trimmed to the
//! configured line budget and re-hashed first), matches panes to tasks
//! through the persisted bindings, re-lists tasks for projects whose
//! `max(last_modified)` moved, and broadcasts a single delta-mode
//! `tmux.status` event when anything changed. Store failures are logged
//! and skipped per project; the rest of the tick still flushes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shellman_core::hash::snapshot_hash;
use shellman_core::protocol::EV_TMUX_STATUS;
use shellman_core::report::{same_pane_content, trim_snapshot, TaskStateReport};
use shellman_store::{PaneBinding, PaneRuntimeRecord, Store, TaskRow, TaskRuntimeRecord};

use crate::registry::Registry;

pub const DEFAULT_TRIM_LINES: usize = 2000;

#[derive(Debug, Clone)]
pub struct TaskStateOptions {
    pub interval: Duration,
    /// Snapshot line budget applied before persisting.
    pub trim_lines: usize,
}

impl Default for TaskStateOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            trim_lines: DEFAULT_TRIM_LINES,
        }
    }
}

// ---------------------------------------------------------------------------
// Delta event payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeDelta {
    pub panes: Vec<PaneRuntimeRecord>,
    pub tasks: Vec<TaskRuntimeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReparentedTask {
    pub task_id: String,
    pub old_parent: Option<String>,
    pub new_parent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectTreeDiff {
    pub project_id: String,
    pub added: Vec<TaskRow>,
    pub removed: Vec<String>,
    pub updated: Vec<TaskRow>,
    pub reparented: Vec<ReparentedTask>,
}

impl ProjectTreeDiff {
    fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.reparented.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusDelta {
    pub mode: String,
    pub runtime: RuntimeDelta,
    pub tree: TreeDelta,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeDelta {
    pub projects: Vec<ProjectTreeDiff>,
}

/// Diff two task lists. Both inputs are sorted by task id so the output
/// is deterministic.
pub fn diff_tasks(project_id: &str, prev: &[TaskRow], curr: &[TaskRow]) -> ProjectTreeDiff {
    let mut diff = ProjectTreeDiff {
        project_id: project_id.to_owned(),
        ..ProjectTreeDiff::default()
    };

    let prev_by_id: HashMap<&str, &TaskRow> =
        prev.iter().map(|t| (t.task_id.as_str(), t)).collect();
    let curr_by_id: HashMap<&str, &TaskRow> =
        curr.iter().map(|t| (t.task_id.as_str(), t)).collect();

    for task in curr {
        match prev_by_id.get(task.task_id.as_str()) {
            None => diff.added.push(task.clone()),
            Some(old) => {
                if old.parent_id != task.parent_id {
                    diff.reparented.push(ReparentedTask {
                        task_id: task.task_id.clone(),
                        old_parent: old.parent_id.clone(),
                        new_parent: task.parent_id.clone(),
                    });
                } else if *old != task {
                    diff.updated.push(task.clone());
                }
            }
        }
    }
    for task in prev {
        if !curr_by_id.contains_key(task.task_id.as_str()) {
            diff.removed.push(task.task_id.clone());
        }
    }

    diff.added.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    diff.removed.sort();
    diff.updated.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    diff.reparented.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    diff
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct TaskStateActor {
    store: Arc<Mutex<Store>>,
    registry: Arc<Registry>,
    opts: TaskStateOptions,
    latest: HashMap<String, TaskStateReport>,
    dirty: BTreeSet<String>,
    /// Per project: the `max(last_modified)` and task list seen last tick.
    tree_cache: HashMap<String, (i64, Vec<TaskRow>)>,
}

impl TaskStateActor {
    pub fn new(store: Arc<Mutex<Store>>, registry: Arc<Registry>, opts: TaskStateOptions) -> Self {
        Self {
            store,
            registry,
            opts,
            latest: HashMap::new(),
            dirty: BTreeSet::new(),
            tree_cache: HashMap::new(),
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Ingest one pane report; identical content does not dirty.
    pub fn on_pane_report(&mut self, report: TaskStateReport) {
        let key = if report.pane_id.is_empty() {
            report.pane_target.clone()
        } else {
            report.pane_id.clone()
        };
        if let Some(existing) = self.latest.get(&key) {
            if same_pane_content(existing, &report) {
                self.latest.insert(key, report);
                return;
            }
        }
        self.latest.insert(key.clone(), report);
        self.dirty.insert(key);
    }

    /// One flush cycle; returns the delta event if anything changed.
    pub fn flush_tick(&mut self) -> Option<StatusDelta> {
        let keys: Vec<String> = std::mem::take(&mut self.dirty).into_iter().collect();
        let reports: Vec<TaskStateReport> = keys
            .iter()
            .filter_map(|key| self.latest.get(key).cloned())
            .collect();

        let store = Arc::clone(&self.store);
        let mut store = store.lock().unwrap_or_else(|e| e.into_inner());

        let bindings = match store.load_panes() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "task state: load_panes failed");
                HashMap::new()
            }
        };

        let mut runtime = RuntimeDelta::default();
        for report in &reports {
            let trimmed = trim_snapshot(&report.snapshot, self.opts.trim_lines).to_owned();
            let trimmed_hash = snapshot_hash(&trimmed);
            let task_id = match_binding(&bindings, report);

            runtime.panes.push(PaneRuntimeRecord {
                pane_id: if report.pane_id.is_empty() {
                    report.pane_target.clone()
                } else {
                    report.pane_id.clone()
                },
                pane_target: report.pane_target.clone(),
                snapshot: trimmed,
                snapshot_hash: trimmed_hash,
                runtime_status: report.runtime_status,
                current_command: report.current_command.clone(),
                cursor_x: report.cursor_x,
                cursor_y: report.cursor_y,
                has_cursor: report.has_cursor,
                updated_at: report.updated_at,
            });
            if let Some(task_id) = task_id {
                runtime.tasks.push(TaskRuntimeRecord {
                    task_id,
                    runtime_status: report.runtime_status,
                    updated_at: report.updated_at,
                });
            }
        }

        if !runtime.panes.is_empty() || !runtime.tasks.is_empty() {
            if let Err(e) = store.batch_upsert_runtime(&runtime.panes, &runtime.tasks) {
                tracing::warn!(error = %e, "task state: batch upsert failed");
            }
        }

        // Task tree diffs per project, driven by the cheap max-probe.
        let mut tree = TreeDelta::default();
        let projects = store.list_projects().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "task state: list_projects failed");
            Vec::new()
        });
        for project in projects {
            let max = match store.get_project_max_task_last_modified(&project.project_id) {
                Ok(max) => max,
                Err(e) => {
                    tracing::warn!(project = %project.project_id, error = %e, "task state: max probe failed");
                    continue;
                }
            };
            let cached = self.tree_cache.get(&project.project_id);
            if cached.is_some_and(|(last_max, _)| *last_max == max) {
                continue;
            }
            let tasks = match store.list_tasks_by_project(&project.project_id) {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::warn!(project = %project.project_id, error = %e, "task state: list tasks failed");
                    continue;
                }
            };
            let prev = cached.map(|(_, tasks)| tasks.as_slice()).unwrap_or(&[]);
            let diff = diff_tasks(&project.project_id, prev, &tasks);
            self.tree_cache
                .insert(project.project_id.clone(), (max, tasks));
            if !diff.is_empty() {
                tree.projects.push(diff);
            }
        }
        drop(store);

        if runtime.panes.is_empty() && runtime.tasks.is_empty() && tree.projects.is_empty() {
            return None;
        }
        Some(StatusDelta {
            mode: "delta".to_owned(),
            runtime,
            tree,
        })
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<TaskStateReport>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.opts.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                report = rx.recv() => match report {
                    Some(report) => self.on_pane_report(report),
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Some(delta) = self.flush_tick() {
                        match serde_json::to_value(&delta) {
                            Ok(payload) => self.registry.broadcast_event(EV_TMUX_STATUS, payload),
                            Err(e) => tracing::warn!(error = %e, "task state: encode delta failed"),
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::debug!("task state actor stopped");
    }
}

/// Match a report to a bound task by pane id, target, or uuid.
fn match_binding(
    bindings: &HashMap<String, PaneBinding>,
    report: &TaskStateReport,
) -> Option<String> {
    bindings
        .iter()
        .find(|(_, b)| {
            (!report.pane_id.is_empty() && b.pane_id == report.pane_id)
                || b.pane_target == report.pane_target
                || (!b.pane_uuid.is_empty() && b.pane_uuid == report.pane_id)
        })
        .map(|(task_id, _)| task_id.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::CollectingSink;
    use crate::registry::{RegistryDeps, RegistryOptions};
    use chrono::Utc;
    use shellman_core::input::InputTracker;
    use shellman_core::status::PaneStatus;
    use shellman_tmux::FakeTmux;

    fn make_actor() -> TaskStateActor {
        let tmux = Arc::new(FakeTmux::new());
        let registry = Registry::new(
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
        );
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        TaskStateActor::new(store, registry, TaskStateOptions::default())
    }

    fn report(pane_id: &str, target: &str, snapshot: &str) -> TaskStateReport {
        TaskStateReport {
            pane_id: pane_id.into(),
            pane_target: target.into(),
            current_command: "bash".into(),
            runtime_status: PaneStatus::Ready,
            snapshot: snapshot.into(),
            snapshot_hash: snapshot_hash(snapshot),
            cursor_x: 0,
            cursor_y: 0,
            has_cursor: false,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn identical_reports_do_not_dirty() {
        let mut actor = make_actor();
        actor.on_pane_report(report("%1", "a:0.0", "hello"));
        assert_eq!(actor.dirty_count(), 1);
        actor.flush_tick();
        assert_eq!(actor.dirty_count(), 0);

        actor.on_pane_report(report("%1", "a:0.0", "hello"));
        assert_eq!(actor.dirty_count(), 0, "same content stays clean");

        actor.on_pane_report(report("%1", "a:0.0", "hello world"));
        assert_eq!(actor.dirty_count(), 1);
    }

    #[tokio::test]
    async fn flush_persists_pane_rows_and_emits_delta() {
        let mut actor = make_actor();
        actor.on_pane_report(report("%1", "a:0.0", "prompt$\n"));

        let delta = actor.flush_tick().expect("dirty pane produces a delta");
        assert_eq!(delta.mode, "delta");
        assert_eq!(delta.runtime.panes.len(), 1);
        assert!(delta.runtime.tasks.is_empty(), "no binding, pane-only row");

        let store = actor.store.lock().unwrap();
        let row = store.get_pane_runtime_by_pane_id("%1").unwrap().unwrap();
        assert_eq!(row.pane_target, "a:0.0");
        assert_eq!(row.snapshot, "prompt$\n");

        drop(store);
        assert!(actor.flush_tick().is_none(), "nothing dirty, no delta");
    }

    #[tokio::test]
    async fn bound_pane_writes_task_runtime() {
        let mut actor = make_actor();
        {
            let store = actor.store.lock().unwrap();
            store.insert_project("p1", "demo").unwrap();
            store
                .bind_pane(
                    "task-1",
                    &PaneBinding {
                        pane_id: "%1".into(),
                        pane_target: "a:0.0".into(),
                        pane_uuid: String::new(),
                    },
                )
                .unwrap();
        }

        actor.on_pane_report(report("%1", "a:0.0", "building...\n"));
        let delta = actor.flush_tick().unwrap();
        assert_eq!(delta.runtime.tasks.len(), 1);
        assert_eq!(delta.runtime.tasks[0].task_id, "task-1");
    }

    #[test]
    fn binding_matches_by_target_and_uuid_too() {
        let bindings: HashMap<String, PaneBinding> = [(
            "task-9".to_owned(),
            PaneBinding {
                pane_id: "%9".into(),
                pane_target: "b:1.0".into(),
                pane_uuid: "uuid-9".into(),
            },
        )]
        .into();

        // By target even when pane ids differ.
        let by_target = report("%7", "b:1.0", "x");
        assert_eq!(match_binding(&bindings, &by_target).as_deref(), Some("task-9"));
        // By uuid carried in the report's pane_id slot.
        let by_uuid = report("uuid-9", "other:0.0", "x");
        assert_eq!(match_binding(&bindings, &by_uuid).as_deref(), Some("task-9"));
        // No match at all.
        let none = report("%2", "c:0.0", "x");
        assert_eq!(match_binding(&bindings, &none), None);
    }

    #[tokio::test]
    async fn snapshot_trimmed_before_persisting_and_rehashed() {
        let mut actor = make_actor();
        actor.opts.trim_lines = 2;

        let long = "l1\nl2\nl3\nl4\n";
        actor.on_pane_report(report("%1", "a:0.0", long));
        let delta = actor.flush_tick().unwrap();

        let row = &delta.runtime.panes[0];
        assert_eq!(row.snapshot, "l3\nl4\n");
        assert_eq!(row.snapshot_hash, snapshot_hash("l3\nl4\n"));
        assert_ne!(row.snapshot_hash, snapshot_hash(long));
    }

    #[tokio::test]
    async fn tree_diff_emits_on_task_changes_only() {
        let mut actor = make_actor();
        {
            let store = actor.store.lock().unwrap();
            store.insert_project("p1", "demo").unwrap();
        }

        // First tick sees no tasks: empty diff, no delta at all.
        assert!(actor.flush_tick().is_none());

        {
            let store = actor.store.lock().unwrap();
            store
                .insert_task(&TaskRow {
                    task_id: "t1".into(),
                    project_id: "p1".into(),
                    parent_id: None,
                    title: "build".into(),
                    description: String::new(),
                    status: "open".into(),
                    flag: None,
                    status_message: None,
                    last_modified: 100,
                })
                .unwrap();
        }

        let delta = actor.flush_tick().expect("new task produces a tree delta");
        assert_eq!(delta.tree.projects.len(), 1);
        assert_eq!(delta.tree.projects[0].added.len(), 1);
        assert_eq!(delta.tree.projects[0].added[0].task_id, "t1");

        // Unchanged max: the next tick does not re-list or emit.
        assert!(actor.flush_tick().is_none());
    }

    #[test]
    fn diff_tasks_classifies_changes() {
        fn task(id: &str, parent: Option<&str>, title: &str, modified: i64) -> TaskRow {
            TaskRow {
                task_id: id.into(),
                project_id: "p1".into(),
                parent_id: parent.map(String::from),
                title: title.into(),
                description: String::new(),
                status: "open".into(),
                flag: None,
                status_message: None,
                last_modified: modified,
            }
        }

        let prev = vec![
            task("t1", None, "one", 1),
            task("t2", Some("t1"), "two", 1),
            task("t3", None, "three", 1),
        ];
        let curr = vec![
            task("t1", None, "one renamed", 2),
            task("t2", Some("t3"), "two", 2),
            task("t4", None, "four", 2),
        ];

        let diff = diff_tasks("p1", &prev, &curr);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].task_id, "t4");
        assert_eq!(diff.removed, vec!["t3"]);
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].task_id, "t1");
        assert_eq!(
            diff.reparented,
            vec![ReparentedTask {
                task_id: "t2".into(),
                old_parent: Some("t1".into()),
                new_parent: Some("t3".into()),
            }]
        );
    }
}

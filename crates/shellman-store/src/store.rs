use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};
use serde::{Deserialize, Serialize};

use shellman_core::status::PaneStatus;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub project_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    pub task_id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub status: String,
    pub flag: Option<String>,
    pub status_message: Option<String>,
    /// Epoch milliseconds; drives the task-state actor's cheap change probe.
    pub last_modified: i64,
}

/// Binding of a task to the tmux pane it runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneBinding {
    pub pane_id: String,
    pub pane_target: String,
    pub pane_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneRuntimeRecord {
    pub pane_id: String,
    pub pane_target: String,
    pub snapshot: String,
    pub snapshot_hash: String,
    pub runtime_status: PaneStatus,
    pub current_command: String,
    pub cursor_x: u32,
    pub cursor_y: u32,
    pub has_cursor: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRuntimeRecord {
    pub task_id: String,
    pub runtime_status: PaneStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessageRow {
    pub message_id: i64,
    pub task_id: String,
    pub source: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed store. One writer at a time; the task-state actor owns
/// the handle and batches its writes in a single transaction per tick.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                project_id     TEXT PRIMARY KEY,
                name           TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tasks (
                task_id        TEXT PRIMARY KEY,
                project_id     TEXT NOT NULL,
                parent_id      TEXT,
                title          TEXT NOT NULL DEFAULT '',
                description    TEXT NOT NULL DEFAULT '',
                status         TEXT NOT NULL DEFAULT '',
                flag           TEXT,
                status_message TEXT,
                last_modified  INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS pane_bindings (
                task_id        TEXT PRIMARY KEY,
                pane_id        TEXT NOT NULL,
                pane_target    TEXT NOT NULL,
                pane_uuid      TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS pane_runtime (
                pane_id        TEXT PRIMARY KEY,
                pane_target    TEXT NOT NULL,
                snapshot       TEXT NOT NULL DEFAULT '',
                snapshot_hash  TEXT NOT NULL DEFAULT '',
                runtime_status TEXT NOT NULL DEFAULT 'unknown',
                current_command TEXT NOT NULL DEFAULT '',
                cursor_x       INTEGER NOT NULL DEFAULT 0,
                cursor_y       INTEGER NOT NULL DEFAULT 0,
                has_cursor     INTEGER NOT NULL DEFAULT 0,
                updated_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_runtime (
                task_id        TEXT PRIMARY KEY,
                runtime_status TEXT NOT NULL DEFAULT 'unknown',
                updated_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_messages (
                message_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id        TEXT NOT NULL,
                source         TEXT NOT NULL,
                body           TEXT NOT NULL,
                created_at     TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projects and tasks
    // ------------------------------------------------------------------

    pub fn insert_project(&self, project_id: &str, name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO projects (project_id, name) VALUES (?1, ?2)",
            params![project_id, name],
        )?;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT project_id, name FROM projects ORDER BY project_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ProjectRow {
                project_id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        rows.collect()
    }

    pub fn insert_task(&self, task: &TaskRow) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO tasks
                (task_id, project_id, parent_id, title, description, status,
                 flag, status_message, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.task_id,
                task.project_id,
                task.parent_id,
                task.title,
                task.description,
                task.status,
                task.flag,
                task.status_message,
                task.last_modified,
            ],
        )?;
        Ok(())
    }

    pub fn update_task_flag(
        &self,
        task_id: &str,
        flag: &str,
        status_message: &str,
        last_modified: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET flag = ?2, status_message = ?3, last_modified = ?4
             WHERE task_id = ?1",
            params![task_id, flag, status_message, last_modified],
        )?;
        Ok(())
    }

    pub fn list_tasks_by_project(&self, project_id: &str) -> Result<Vec<TaskRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, project_id, parent_id, title, description, status,
                    flag, status_message, last_modified
             FROM tasks WHERE project_id = ?1 ORDER BY task_id",
        )?;
        let rows = stmt.query_map(params![project_id], task_from_row)?;
        rows.collect()
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRow>> {
        self.conn
            .query_row(
                "SELECT task_id, project_id, parent_id, title, description, status,
                        flag, status_message, last_modified
                 FROM tasks WHERE task_id = ?1",
                params![task_id],
                task_from_row,
            )
            .optional()
    }

    /// Max `last_modified` across a project's tasks; 0 when it has none.
    pub fn get_project_max_task_last_modified(&self, project_id: &str) -> Result<i64> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(last_modified), 0) FROM tasks WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )
    }

    // ------------------------------------------------------------------
    // Pane bindings
    // ------------------------------------------------------------------

    pub fn bind_pane(&self, task_id: &str, binding: &PaneBinding) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pane_bindings
                (task_id, pane_id, pane_target, pane_uuid)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                task_id,
                binding.pane_id,
                binding.pane_target,
                binding.pane_uuid,
            ],
        )?;
        Ok(())
    }

    pub fn load_panes(&self) -> Result<HashMap<String, PaneBinding>> {
        let mut stmt = self
            .conn
            .prepare("SELECT task_id, pane_id, pane_target, pane_uuid FROM pane_bindings")?;
        let rows = stmt.query_map([], |row| {
            let task_id: String = row.get(0)?;
            Ok((
                task_id,
                PaneBinding {
                    pane_id: row.get(1)?,
                    pane_target: row.get(2)?,
                    pane_uuid: row.get(3)?,
                },
            ))
        })?;
        rows.collect()
    }

    // ------------------------------------------------------------------
    // Runtime rows
    // ------------------------------------------------------------------

    /// Upsert pane and task runtime rows in one transaction.
    pub fn batch_upsert_runtime(
        &mut self,
        panes: &[PaneRuntimeRecord],
        tasks: &[TaskRuntimeRecord],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for pane in panes {
            tx.execute(
                "INSERT OR REPLACE INTO pane_runtime
                    (pane_id, pane_target, snapshot, snapshot_hash,
                     runtime_status, current_command, cursor_x, cursor_y,
                     has_cursor, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    pane.pane_id,
                    pane.pane_target,
                    pane.snapshot,
                    pane.snapshot_hash,
                    pane.runtime_status.as_str(),
                    pane.current_command,
                    pane.cursor_x,
                    pane.cursor_y,
                    pane.has_cursor,
                    pane.updated_at.to_rfc3339(),
                ],
            )?;
        }
        for task in tasks {
            tx.execute(
                "INSERT OR REPLACE INTO task_runtime (task_id, runtime_status, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    task.task_id,
                    task.runtime_status.as_str(),
                    task.updated_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()
    }

    pub fn get_pane_runtime_by_pane_id(
        &self,
        pane_id: &str,
    ) -> Result<Option<PaneRuntimeRecord>> {
        self.conn
            .query_row(
                "SELECT pane_id, pane_target, snapshot, snapshot_hash,
                        runtime_status, current_command, cursor_x, cursor_y,
                        has_cursor, updated_at
                 FROM pane_runtime WHERE pane_id = ?1",
                params![pane_id],
                |row| {
                    let status: String = row.get(4)?;
                    let updated_at: String = row.get(9)?;
                    Ok(PaneRuntimeRecord {
                        pane_id: row.get(0)?,
                        pane_target: row.get(1)?,
                        snapshot: row.get(2)?,
                        snapshot_hash: row.get(3)?,
                        runtime_status: PaneStatus::parse(&status),
                        current_command: row.get(5)?,
                        cursor_x: row.get(6)?,
                        cursor_y: row.get(7)?,
                        has_cursor: row.get(8)?,
                        updated_at: DateTime::parse_from_rfc3339(&updated_at)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()
    }

    // ------------------------------------------------------------------
    // Task messages
    // ------------------------------------------------------------------

    pub fn insert_task_message(
        &self,
        task_id: &str,
        source: &str,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO task_messages (task_id, source, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![task_id, source, body, created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_task_messages(&self, task_id: &str) -> Result<Vec<TaskMessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, task_id, source, body, created_at
             FROM task_messages WHERE task_id = ?1 ORDER BY message_id",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            let created_at: String = row.get(4)?;
            Ok(TaskMessageRow {
                message_id: row.get(0)?,
                task_id: row.get(1)?,
                source: row.get(2)?,
                body: row.get(3)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect()
    }

    /// All persisted pane runtime rows, for startup baseline hydration.
    pub fn list_pane_runtime(&self) -> Result<Vec<PaneRuntimeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT pane_id, pane_target, snapshot, snapshot_hash,
                    runtime_status, current_command, cursor_x, cursor_y,
                    has_cursor, updated_at
             FROM pane_runtime",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(4)?;
            let updated_at: String = row.get(9)?;
            Ok(PaneRuntimeRecord {
                pane_id: row.get(0)?,
                pane_target: row.get(1)?,
                snapshot: row.get(2)?,
                snapshot_hash: row.get(3)?,
                runtime_status: PaneStatus::parse(&status),
                current_command: row.get(5)?,
                cursor_x: row.get(6)?,
                cursor_y: row.get(7)?,
                has_cursor: row.get(8)?,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect()
    }
}

fn task_from_row(row: &rusqlite::Row<'_>) -> Result<TaskRow> {
    Ok(TaskRow {
        task_id: row.get(0)?,
        project_id: row.get(1)?,
        parent_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: row.get(5)?,
        flag: row.get(6)?,
        status_message: row.get(7)?,
        last_modified: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pane_record(pane_id: &str, target: &str) -> PaneRuntimeRecord {
        PaneRuntimeRecord {
            pane_id: pane_id.into(),
            pane_target: target.into(),
            snapshot: "prompt$\n".into(),
            snapshot_hash: "abc123".into(),
            runtime_status: PaneStatus::Ready,
            current_command: "bash".into(),
            cursor_x: 8,
            cursor_y: 0,
            has_cursor: true,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn open_in_memory_creates_tables() {
        let store = Store::open_in_memory().expect("open in-memory db");
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM pane_runtime", [], |row| row.get(0))
            .expect("pane_runtime table exists");
        assert_eq!(count, 0);
    }

    #[test]
    fn open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shellman.db");
        {
            let mut store = Store::open(&path).unwrap();
            store
                .batch_upsert_runtime(&[pane_record("%1", "main:0.0")], &[])
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        let loaded = store.get_pane_runtime_by_pane_id("%1").unwrap().unwrap();
        assert_eq!(loaded.pane_target, "main:0.0");
        assert_eq!(loaded.runtime_status, PaneStatus::Ready);
    }

    #[test]
    fn pane_runtime_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        let original = pane_record("%1", "main:0.0");
        store.batch_upsert_runtime(&[original.clone()], &[]).unwrap();

        let loaded = store.get_pane_runtime_by_pane_id("%1").unwrap().unwrap();
        assert_eq!(loaded.snapshot, original.snapshot);
        assert_eq!(loaded.snapshot_hash, original.snapshot_hash);
        assert_eq!(loaded.cursor_x, 8);
        assert!(loaded.has_cursor);
        let delta = (loaded.updated_at - original.updated_at)
            .num_milliseconds()
            .abs();
        assert!(delta < 1000, "updated_at roundtrips, delta={delta}ms");
    }

    #[test]
    fn batch_upsert_overwrites_and_writes_tasks() {
        let mut store = Store::open_in_memory().unwrap();
        let mut pane = pane_record("%1", "main:0.0");
        store.batch_upsert_runtime(&[pane.clone()], &[]).unwrap();

        pane.runtime_status = PaneStatus::Running;
        pane.snapshot = "prompt$ cargo test\n".into();
        let task = TaskRuntimeRecord {
            task_id: "task-1".into(),
            runtime_status: PaneStatus::Running,
            updated_at: Utc::now(),
        };
        store
            .batch_upsert_runtime(&[pane.clone()], &[task])
            .unwrap();

        let loaded = store.get_pane_runtime_by_pane_id("%1").unwrap().unwrap();
        assert_eq!(loaded.runtime_status, PaneStatus::Running);
        assert!(loaded.snapshot.contains("cargo test"));

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM task_runtime", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn missing_pane_runtime_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_pane_runtime_by_pane_id("%9").unwrap().is_none());
    }

    #[test]
    fn load_panes_maps_task_to_binding() {
        let store = Store::open_in_memory().unwrap();
        store
            .bind_pane(
                "task-1",
                &PaneBinding {
                    pane_id: "%1".into(),
                    pane_target: "main:0.0".into(),
                    pane_uuid: "uuid-1".into(),
                },
            )
            .unwrap();
        store
            .bind_pane(
                "task-2",
                &PaneBinding {
                    pane_id: "%2".into(),
                    pane_target: "main:0.1".into(),
                    pane_uuid: "uuid-2".into(),
                },
            )
            .unwrap();

        let panes = store.load_panes().unwrap();
        assert_eq!(panes.len(), 2);
        assert_eq!(panes["task-1"].pane_target, "main:0.0");
        assert_eq!(panes["task-2"].pane_uuid, "uuid-2");
    }

    #[test]
    fn task_queries() {
        let store = Store::open_in_memory().unwrap();
        store.insert_project("p1", "demo").unwrap();
        store
            .insert_task(&TaskRow {
                task_id: "t1".into(),
                project_id: "p1".into(),
                parent_id: None,
                title: "build".into(),
                description: "build the crate".into(),
                status: "open".into(),
                flag: None,
                status_message: None,
                last_modified: 100,
            })
            .unwrap();
        store
            .insert_task(&TaskRow {
                task_id: "t2".into(),
                project_id: "p1".into(),
                parent_id: Some("t1".into()),
                title: "test".into(),
                description: String::new(),
                status: "open".into(),
                flag: None,
                status_message: None,
                last_modified: 250,
            })
            .unwrap();

        let tasks = store.list_tasks_by_project("p1").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_id, "t1");
        assert_eq!(tasks[1].parent_id.as_deref(), Some("t1"));

        assert_eq!(store.get_project_max_task_last_modified("p1").unwrap(), 250);
        assert_eq!(store.get_project_max_task_last_modified("p9").unwrap(), 0);

        store.update_task_flag("t1", "success", "done", 400).unwrap();
        assert_eq!(store.get_project_max_task_last_modified("p1").unwrap(), 400);
        let tasks = store.list_tasks_by_project("p1").unwrap();
        assert_eq!(tasks[0].flag.as_deref(), Some("success"));
        assert_eq!(tasks[0].status_message.as_deref(), Some("done"));
    }

    #[test]
    fn task_messages_append_in_order() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_task_message("t1", "parent", "first", Utc::now())
            .unwrap();
        store
            .insert_task_message("t1", "child:c1", "second", Utc::now())
            .unwrap();
        store
            .insert_task_message("t2", "parent", "other task", Utc::now())
            .unwrap();

        let msgs = store.list_task_messages("t1").unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].body, "first");
        assert_eq!(msgs[1].source, "child:c1");
    }

    #[test]
    fn list_pane_runtime_returns_all_rows() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .batch_upsert_runtime(
                &[pane_record("%1", "a:0.0"), pane_record("%2", "a:0.1")],
                &[],
            )
            .unwrap();
        let rows = store.list_pane_runtime().unwrap();
        assert_eq!(rows.len(), 2);
    }
}

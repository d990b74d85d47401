//! SQLite persistence for projects, tasks, pane bindings, and pane/task
//! runtime state, allowing pane status and activity timestamps to survive
//! daemon restarts.

mod store;

pub use rusqlite::Error as StoreError;
pub use store::{
    PaneBinding, PaneRuntimeRecord, ProjectRow, Store, TaskMessageRow, TaskRow,
    TaskRuntimeRecord,
};

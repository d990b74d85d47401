//! Task-scoped tools: flagging the current task, and the child-task
//! lifecycle (spawn into a new pane, read context and tty output, pass
//! messages up and down).

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use shellman_llm::args::{
    ChildIdArgs, ParentReportArgs, SendMessageArgs, SetFlagArgs, SpawnChildArgs, TtyOutputArgs,
};
use shellman_llm::tool::{Tool, ToolError, ToolScope};
use shellman_llm::types::ToolSpec;
use shellman_store::{PaneBinding, Store, TaskRow};
use shellman_tmux::TmuxFacade;

use super::{store_tool_error, tmux_tool_error};

fn lock_store(store: &Mutex<Store>) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

fn task_not_found(task_id: &str) -> ToolError {
    ToolError::new(
        format!("task not found: {task_id}"),
        "pass an id returned by task.child.spawn",
    )
}

// ---------------------------------------------------------------------------
// task.current.set_flag
// ---------------------------------------------------------------------------

pub struct SetFlagTool {
    store: Arc<Mutex<Store>>,
}

impl SetFlagTool {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SetFlagTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "task.current.set_flag",
            "Flag the current task (success, notify, or error) with a status message.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "flag": { "type": "string", "enum": ["success", "notify", "error"] },
                    "status_message": { "type": "string" },
                },
                "required": ["flag", "status_message"],
            }),
        )
    }

    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        let task_id = scope.require_task()?;
        let args = SetFlagArgs::parse_and_validate(arguments)?;

        let store = lock_store(&self.store);
        store
            .get_task(task_id)
            .map_err(|e| store_tool_error(&e))?
            .ok_or_else(|| task_not_found(task_id))?;
        store
            .update_task_flag(
                task_id,
                &args.flag,
                &args.status_message,
                Utc::now().timestamp_millis(),
            )
            .map_err(|e| store_tool_error(&e))?;

        Ok(serde_json::json!({ "ok": true, "flag": args.flag }).to_string())
    }
}

// ---------------------------------------------------------------------------
// task.child.spawn
// ---------------------------------------------------------------------------

pub struct SpawnChildTool {
    tmux: Arc<dyn TmuxFacade>,
    store: Arc<Mutex<Store>>,
}

impl SpawnChildTool {
    pub fn new(tmux: Arc<dyn TmuxFacade>, store: Arc<Mutex<Store>>) -> Self {
        Self { tmux, store }
    }
}

#[async_trait]
impl Tool for SpawnChildTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "task.child.spawn",
            "Spawn a child task in a new pane below the current one and start its command.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "prompt": { "type": "string" },
                    "task_role": { "type": "string", "enum": ["executor"] },
                },
                "required": ["command", "title", "description", "prompt"],
            }),
        )
    }

    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        let parent_id = scope.require_task()?;
        let base_target = scope.require_pane()?;
        let args = SpawnChildArgs::parse_and_validate(arguments)?;

        let project_id = match &scope.project_id {
            Some(project_id) => project_id.clone(),
            None => {
                let store = lock_store(&self.store);
                store
                    .get_task(parent_id)
                    .map_err(|e| store_tool_error(&e))?
                    .ok_or_else(|| task_not_found(parent_id))?
                    .project_id
            }
        };

        let child_target = self
            .tmux
            .create_child_pane(base_target)
            .await
            .map_err(|e| tmux_tool_error(&e))?;

        let child_id = format!("task-{}", Uuid::new_v4());
        let pane_uuid = Uuid::new_v4().to_string();
        {
            let store = lock_store(&self.store);
            store
                .insert_task(&TaskRow {
                    task_id: child_id.clone(),
                    project_id,
                    parent_id: Some(parent_id.to_owned()),
                    title: args.title.clone(),
                    description: args.description.clone(),
                    status: "open".to_owned(),
                    flag: None,
                    status_message: None,
                    last_modified: Utc::now().timestamp_millis(),
                })
                .map_err(|e| store_tool_error(&e))?;
            store
                .bind_pane(
                    &child_id,
                    &PaneBinding {
                        pane_id: String::new(),
                        pane_target: child_target.clone(),
                        pane_uuid,
                    },
                )
                .map_err(|e| store_tool_error(&e))?;
            store
                .insert_task_message(
                    &child_id,
                    &format!("task:{parent_id}"),
                    &args.prompt,
                    Utc::now(),
                )
                .map_err(|e| store_tool_error(&e))?;
        }

        self.tmux
            .send_input(&child_target, &format!("{}\r", args.command))
            .await
            .map_err(|e| tmux_tool_error(&e))?;

        Ok(serde_json::json!({
            "child_task_id": child_id,
            "pane_target": child_target,
        })
        .to_string())
    }
}

// ---------------------------------------------------------------------------
// task.child.get_context
// ---------------------------------------------------------------------------

pub struct ChildContextTool {
    store: Arc<Mutex<Store>>,
}

impl ChildContextTool {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ChildContextTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "task.child.get_context",
            "Read a child task's row, pane binding, and message history.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "child_task_id": { "type": "string" },
                },
                "required": ["child_task_id"],
            }),
        )
    }

    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        scope.require_task()?;
        let child_id = ChildIdArgs::parse_and_validate(arguments)?;

        let store = lock_store(&self.store);
        let task = store
            .get_task(&child_id)
            .map_err(|e| store_tool_error(&e))?
            .ok_or_else(|| task_not_found(&child_id))?;
        let messages = store
            .list_task_messages(&child_id)
            .map_err(|e| store_tool_error(&e))?;
        let binding = store
            .load_panes()
            .map_err(|e| store_tool_error(&e))?
            .remove(&child_id);

        Ok(serde_json::json!({
            "task": task,
            "binding": binding,
            "messages": messages,
        })
        .to_string())
    }
}

// ---------------------------------------------------------------------------
// task.child.get_tty_output
// ---------------------------------------------------------------------------

pub struct ChildTtyOutputTool {
    store: Arc<Mutex<Store>>,
}

impl ChildTtyOutputTool {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ChildTtyOutputTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "task.child.get_tty_output",
            "Read the child's persisted pane snapshot from a byte offset.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "child_task_id": { "type": "string" },
                    "offset": { "type": "integer", "minimum": 0 },
                },
                "required": ["child_task_id"],
            }),
        )
    }

    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        scope.require_task()?;
        let (child_id, offset) = TtyOutputArgs::parse_and_validate(arguments)?;

        let store = lock_store(&self.store);
        let binding = store
            .load_panes()
            .map_err(|e| store_tool_error(&e))?
            .remove(&child_id)
            .ok_or_else(|| {
                ToolError::new(
                    format!("no pane bound to task {child_id}"),
                    "spawn the child first; bindings appear after task.child.spawn",
                )
            })?;

        // Runtime rows key on pane_id, with the target as fallback key for
        // panes discovered before their id was known.
        let mut row = store
            .get_pane_runtime_by_pane_id(&binding.pane_id)
            .map_err(|e| store_tool_error(&e))?;
        if row.is_none() {
            row = store
                .get_pane_runtime_by_pane_id(&binding.pane_target)
                .map_err(|e| store_tool_error(&e))?;
        }
        let row = row.ok_or_else(|| {
            ToolError::new(
                format!("no runtime snapshot yet for task {child_id}"),
                "wait a moment for the first task-state flush and retry",
            )
        })?;

        let snapshot = row.snapshot;
        let mut start = (offset as usize).min(snapshot.len());
        while start > 0 && !snapshot.is_char_boundary(start) {
            start -= 1;
        }

        Ok(serde_json::json!({
            "output": &snapshot[start..],
            "next_offset": snapshot.len(),
            "runtime_status": row.runtime_status,
        })
        .to_string())
    }
}

// ---------------------------------------------------------------------------
// task.child.send_message / task.parent.report
// ---------------------------------------------------------------------------

pub struct SendMessageTool {
    store: Arc<Mutex<Store>>,
}

impl SendMessageTool {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "task.child.send_message",
            "Append a message to a child task's conversation.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "child_task_id": { "type": "string" },
                    "message": { "type": "string" },
                },
                "required": ["child_task_id", "message"],
            }),
        )
    }

    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        let parent_id = scope.require_task()?;
        let args = SendMessageArgs::parse_and_validate(arguments)?;

        let store = lock_store(&self.store);
        store
            .get_task(&args.child_task_id)
            .map_err(|e| store_tool_error(&e))?
            .ok_or_else(|| task_not_found(&args.child_task_id))?;
        store
            .insert_task_message(
                &args.child_task_id,
                &format!("task:{parent_id}"),
                &args.message,
                Utc::now(),
            )
            .map_err(|e| store_tool_error(&e))?;
        Ok(serde_json::json!({ "ok": true }).to_string())
    }
}

pub struct ParentReportTool {
    store: Arc<Mutex<Store>>,
}

impl ParentReportTool {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ParentReportTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::function(
            "task.parent.report",
            "Report progress from the current task to its parent task.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string" },
                },
                "required": ["message"],
            }),
        )
    }

    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        _call_id: &str,
    ) -> Result<String, ToolError> {
        let task_id = scope.require_task()?;
        let message = ParentReportArgs::parse_and_validate(arguments)?;

        let store = lock_store(&self.store);
        let task = store
            .get_task(task_id)
            .map_err(|e| store_tool_error(&e))?
            .ok_or_else(|| task_not_found(task_id))?;
        let parent_id = task.parent_id.ok_or_else(|| {
            ToolError::new(
                format!("task {task_id} has no parent"),
                "only child tasks can report upward",
            )
        })?;
        store
            .insert_task_message(&parent_id, &format!("child:{task_id}"), &message, Utc::now())
            .map_err(|e| store_tool_error(&e))?;
        Ok(serde_json::json!({ "ok": true, "parent_task_id": parent_id }).to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Built-in tools the action loop can invoke against panes and tasks.

mod pane_io;
mod task;

use std::sync::{Arc, Mutex};

use shellman_core::input::InputTracker;
use shellman_llm::client::LlmError;
use shellman_llm::tool::{ToolError, ToolRegistry};
use shellman_store::Store;
use shellman_tmux::{TmuxError, TmuxFacade};

pub use pane_io::{ExecCommandTool, InputPromptTool, ReadfileTool, WriteStdinTool};
pub use task::{
    ChildContextTool, ChildTtyOutputTool, ParentReportTool, SendMessageTool, SetFlagTool,
    SpawnChildTool,
};

/// Capabilities shared by the built-in tools.
pub struct ToolDeps {
    pub tmux: Arc<dyn TmuxFacade>,
    pub store: Arc<Mutex<Store>>,
    pub input_tracker: Arc<Mutex<InputTracker>>,
    /// Whether the current allowlist implies raw shell mode; re-checked
    /// per call so mode switches apply immediately.
    pub raw_shell_mode: Arc<dyn Fn() -> bool + Send + Sync>,
}

/// Register every built-in tool.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    deps: &ToolDeps,
) -> Result<(), LlmError> {
    registry.register(WriteStdinTool::new(
        Arc::clone(&deps.tmux),
        Arc::clone(&deps.input_tracker),
        Arc::clone(&deps.raw_shell_mode),
    ))?;
    registry.register(ExecCommandTool::new())?;
    registry.register(ReadfileTool::new())?;
    registry.register(InputPromptTool::new(
        Arc::clone(&deps.tmux),
        Arc::clone(&deps.input_tracker),
    ))?;
    registry.register(SetFlagTool::new(Arc::clone(&deps.store)))?;
    registry.register(SpawnChildTool::new(
        Arc::clone(&deps.tmux),
        Arc::clone(&deps.store),
    ))?;
    registry.register(ChildContextTool::new(Arc::clone(&deps.store)))?;
    registry.register(ChildTtyOutputTool::new(Arc::clone(&deps.store)))?;
    registry.register(SendMessageTool::new(Arc::clone(&deps.store)))?;
    registry.register(ParentReportTool::new(Arc::clone(&deps.store)))?;
    Ok(())
}

pub(crate) fn tmux_tool_error(err: &TmuxError) -> ToolError {
    if err.is_pane_missing() {
        ToolError::new(
            format!("pane is gone: {err}"),
            "the pane ended; re-list panes or spawn a new one",
        )
    } else {
        ToolError::new(
            format!("tmux error: {err}"),
            "retry, or check that the tmux server is running",
        )
    }
}

pub(crate) fn store_tool_error(err: &shellman_store::StoreError) -> ToolError {
    ToolError::new(
        format!("store error: {err}"),
        "retry; if this persists the daemon's database is unhealthy",
    )
}

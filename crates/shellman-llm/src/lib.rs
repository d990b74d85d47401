//! LLM tool runtime: a responses-API client abstraction, the tool
//! schema/registry/allowlist machinery, per-tool argument validation, and
//! the multi-turn action loop that drives panes on the model's behalf.

pub mod action;
pub mod args;
pub mod client;
pub mod http;
pub mod tool;
pub mod types;

pub use action::{ActionLoop, ActionLoopOptions, Allowlist};
pub use client::{LlmError, ResponsesClient};
pub use tool::{Tool, ToolError, ToolRegistry, ToolScope, NO_SUGGESTION};
pub use types::{AssembledToolCall, InputItem, ResponsesRequest, ResponsesResult, ToolSpec};

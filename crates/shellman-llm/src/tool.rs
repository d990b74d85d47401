//! Pluggable tool system.
//!
//! Tools are async trait objects the model invokes through the action
//! loop. Every failure is shaped into the uniform `{error, suggest}`
//! envelope so the model can read the problem and correct itself; the
//! loop never raises out of a tool call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::LlmError;
use crate::types::ToolSpec;

/// Placeholder suggestion; `suggest` is never empty on the wire.
pub const NO_SUGGESTION: &str = "NO_SUGGESTION";

pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

/// Uniform tool failure envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub error: String,
    pub suggest: String,
}

impl ToolError {
    pub fn new(error: impl Into<String>, suggest: impl Into<String>) -> Self {
        let suggest = suggest.into();
        Self {
            error: error.into(),
            suggest: if suggest.is_empty() {
                NO_SUGGESTION.to_owned()
            } else {
                suggest
            },
        }
    }

    pub fn plain(error: impl Into<String>) -> Self {
        Self::new(error, NO_SUGGESTION)
    }

    /// Serialize into the function_call_output payload.
    pub fn to_output_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","suggest":"{}"}}"#,
                self.error.replace('"', "'"),
                self.suggest.replace('"', "'"),
            )
        })
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Context a tool call runs in. Task-scoped tools refuse to run without a
/// task binding.
#[derive(Debug, Clone, Default)]
pub struct ToolScope {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub pane_target: Option<String>,
}

impl ToolScope {
    pub fn require_task(&self) -> Result<&str, ToolError> {
        self.task_id.as_deref().ok_or_else(|| {
            ToolError::new(
                "tool requires a task scope",
                "invoke this tool from a task-bound conversation",
            )
        })
    }

    pub fn require_pane(&self) -> Result<&str, ToolError> {
        self.pane_target.as_deref().ok_or_else(|| {
            ToolError::new(
                "tool requires an active pane",
                "select a pane before invoking this tool",
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Tool + registry
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Execute with raw JSON arguments. The returned string is the
    /// function_call_output payload.
    async fn execute(
        &self,
        scope: &ToolScope,
        arguments: &str,
        call_id: &str,
    ) -> Result<String, ToolError>;
}

/// Registry of uniquely named tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; duplicate names are an error.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), LlmError> {
        let name = tool.spec().name;
        if self.tools.contains_key(&name) {
            return Err(LlmError::DuplicateTool(name));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    /// Resolve by registered name, accepting the wire-sanitized form too
    /// (dots in tool names are replaced before hitting strict validators).
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.tools.get(name) {
            return Some(Arc::clone(tool));
        }
        self.tools
            .iter()
            .find(|(registered, _)| sanitize_tool_name(registered) == name)
            .map(|(_, tool)| Arc::clone(tool))
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Specs filtered by an allowlist of registered names. `None` means
    /// every registered tool.
    pub fn specs(&self, allowlist: Option<&[String]>) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|t| t.spec())
            .filter(|spec| match allowlist {
                Some(list) => list.iter().any(|n| n == &spec.name),
                None => true,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Replace every non-alphanumeric character with `_` so replayed
/// `function_call.name` values satisfy strict endpoint validators.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::function("echo", "echoes arguments back", serde_json::json!({}))
        }
        async fn execute(
            &self,
            _scope: &ToolScope,
            arguments: &str,
            _call_id: &str,
        ) -> Result<String, ToolError> {
            Ok(arguments.to_owned())
        }
    }

    struct DottedTool;

    #[async_trait]
    impl Tool for DottedTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::function("task.current.set_flag", "sets the flag", serde_json::json!({}))
        }
        async fn execute(
            &self,
            _scope: &ToolScope,
            _arguments: &str,
            _call_id: &str,
        ) -> Result<String, ToolError> {
            Ok("{}".into())
        }
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        let err = reg.register(EchoTool).unwrap_err();
        assert!(matches!(err, LlmError::DuplicateTool(name) if name == "echo"));
    }

    #[test]
    fn resolve_accepts_sanitized_names() {
        let mut reg = ToolRegistry::new();
        reg.register(DottedTool).unwrap();
        assert!(reg.resolve("task.current.set_flag").is_some());
        assert!(reg.resolve("task_current_set_flag").is_some());
        assert!(reg.resolve("no_such_tool").is_none());
    }

    #[test]
    fn specs_honor_allowlist() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        reg.register(DottedTool).unwrap();

        assert_eq!(reg.specs(None).len(), 2);
        let filtered = reg.specs(Some(&["echo".to_owned()]));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "echo");
        assert!(reg.specs(Some(&[])).is_empty());
    }

    #[test]
    fn tool_error_suggest_never_empty() {
        let err = ToolError::new("boom", "");
        assert_eq!(err.suggest, NO_SUGGESTION);
        let json = err.to_output_json();
        assert!(json.contains("\"error\":\"boom\""));
        assert!(json.contains(NO_SUGGESTION));
    }

    #[test]
    fn sanitize_replaces_non_alphanumerics() {
        assert_eq!(sanitize_tool_name("task.current.set_flag"), "task_current_set_flag");
        assert_eq!(sanitize_tool_name("exec_command"), "exec_command");
        assert_eq!(sanitize_tool_name("weird name!"), "weird_name_");
    }

    #[test]
    fn scope_requirements() {
        let empty = ToolScope::default();
        assert!(empty.require_task().is_err());
        assert!(empty.require_pane().is_err());

        let scoped = ToolScope {
            project_id: Some("p1".into()),
            task_id: Some("t1".into()),
            pane_target: Some("main:0.0".into()),
        };
        assert_eq!(scoped.require_task().unwrap(), "t1");
        assert_eq!(scoped.require_pane().unwrap(), "main:0.0");
    }
}

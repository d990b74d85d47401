//! Responses-API payload types.
//!
//! The action loop replays the full conversation on every turn: the user
//! message plus every prior `function_call` and `function_call_output`.
//! It never references a server-stored response id, because proxies in
//! front of the endpoint may not retain responses.

use serde::{Deserialize, Serialize};

/// One item of conversation input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: String,
        content: String,
    },
    FunctionCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl InputItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self::Message {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Wire-format tool definition sent with each request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    /// JSON-schema for the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".into(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
}

/// A tool call assembled from response output (or stream deltas).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssembledToolCall {
    /// Provider item id, replayed when present.
    pub id: Option<String>,
    pub call_id: String,
    pub name: String,
    /// Accumulated JSON arguments text.
    pub arguments: String,
}

/// Final state of one responses-API exchange.
#[derive(Debug, Clone, Default)]
pub struct ResponsesResult {
    pub text: Option<String>,
    pub tool_calls: Vec<AssembledToolCall>,
    /// Event names seen while consuming the response, for diagnostics when
    /// an exchange produces neither text nor tool calls.
    pub event_trace: Vec<String>,
}

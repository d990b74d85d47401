//! Multi-turn action loop.
//!
//! Each iteration sends the full conversation (user message plus every
//! prior `function_call` / `function_call_output`) with the allowlisted
//! tool specs, executes whatever the model called, and appends the
//! results to the history for the next round. Errors during tool calls
//! are shaped into `{error, suggest}` outputs so the model can read the
//! failure and correct course instead of aborting the loop.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::{LlmError, ResponsesClient};
use crate::tool::{sanitize_tool_name, ToolError, ToolRegistry, ToolScope, TOOL_NOT_FOUND};
use crate::types::{InputItem, ResponsesRequest};

pub const DEFAULT_MAX_ITERATIONS: usize = 8;

/// Tool allowlist: either fixed for the conversation or re-resolved every
/// iteration so mode switches apply mid-loop.
#[derive(Clone)]
pub enum Allowlist {
    Static(Vec<String>),
    Resolver(Arc<dyn Fn() -> Vec<String> + Send + Sync>),
}

impl Allowlist {
    pub fn current(&self) -> Vec<String> {
        match self {
            Self::Static(list) => list.clone(),
            Self::Resolver(resolve) => resolve(),
        }
    }

    /// Raw shell mode drives stricter `write_stdin` validation: the model
    /// has `exec_command` available but no interactive prompt tool.
    pub fn raw_shell_mode(list: &[String]) -> bool {
        list.iter().any(|n| n == "exec_command") && !list.iter().any(|n| n == "task.input_prompt")
    }
}

#[derive(Debug, Clone)]
pub struct ActionLoopOptions {
    pub model: String,
    pub max_iterations: usize,
}

impl ActionLoopOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

pub struct ActionLoop {
    client: Arc<dyn ResponsesClient>,
    registry: Arc<ToolRegistry>,
    opts: ActionLoopOptions,
}

impl ActionLoop {
    pub fn new(
        client: Arc<dyn ResponsesClient>,
        registry: Arc<ToolRegistry>,
        opts: ActionLoopOptions,
    ) -> Self {
        Self {
            client,
            registry,
            opts,
        }
    }

    /// Run the loop for one user message; returns the model's final text.
    pub async fn run(
        &self,
        scope: &ToolScope,
        user_message: &str,
        allowlist: Option<&Allowlist>,
        text_sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<String, LlmError> {
        let mut history: Vec<InputItem> = vec![InputItem::user(user_message)];

        for iteration in 1..=self.opts.max_iterations {
            // Resolver allowlists are re-evaluated every round.
            let allowed = allowlist.map(Allowlist::current);
            let request = ResponsesRequest {
                model: self.opts.model.clone(),
                input: replay_items(&history),
                tools: self.registry.specs(allowed.as_deref()),
                stream: text_sink.is_some(),
            };
            tracing::debug!(
                iteration,
                items = request.input.len(),
                tools = request.tools.len(),
                "action loop: sending request"
            );

            let result = self.client.create(&request, text_sink.as_ref()).await?;

            if let Some(text) = result.text {
                return Ok(text);
            }
            if result.tool_calls.is_empty() {
                return Err(LlmError::NoOutput {
                    trace: result.event_trace.join(","),
                });
            }

            for call in result.tool_calls {
                if call.call_id.is_empty() {
                    return Err(LlmError::EmptyCallId);
                }

                let output = self
                    .dispatch(scope, &call.name, &call.arguments, &call.call_id, allowed.as_deref())
                    .await;
                tracing::debug!(
                    iteration,
                    tool = %call.name,
                    call_id = %call.call_id,
                    "action loop: tool call finished"
                );

                history.push(InputItem::FunctionCall {
                    id: call.id.clone(),
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                history.push(InputItem::FunctionCallOutput {
                    call_id: call.call_id,
                    output,
                });
            }
        }

        Err(LlmError::MaxIterations(self.opts.max_iterations))
    }

    /// Resolve, gate, and execute one call. Always yields an output
    /// string; failures become `{error, suggest}` payloads.
    async fn dispatch(
        &self,
        scope: &ToolScope,
        name: &str,
        arguments: &str,
        call_id: &str,
        allowed: Option<&[String]>,
    ) -> String {
        let Some(tool) = self.registry.resolve(name) else {
            return ToolError::new(
                TOOL_NOT_FOUND,
                format!("no tool named {name} is registered"),
            )
            .to_output_json();
        };
        let registered = tool.spec().name;

        if let Some(allowed) = allowed {
            if !allowed.iter().any(|n| n == &registered) {
                return ToolError::new(
                    format!("tool {registered} is not allowed in the current mode"),
                    format!("use one of: {}", allowed.join(", ")),
                )
                .to_output_json();
            }
        }

        match tool.execute(scope, arguments, call_id).await {
            Ok(output) => output,
            Err(err) => err.to_output_json(),
        }
    }
}

/// Clone history for the wire, sanitizing replayed `function_call.name`
/// values for strict validators.
fn replay_items(history: &[InputItem]) -> Vec<InputItem> {
    history
        .iter()
        .map(|item| match item {
            InputItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
            } => InputItem::FunctionCall {
                id: id.clone(),
                call_id: call_id.clone(),
                name: sanitize_tool_name(name),
                arguments: arguments.clone(),
            },
            other => other.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssembledToolCall, ResponsesResult, ToolSpec};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<VecDeque<ResponsesResult>>,
        requests: Mutex<Vec<ResponsesRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<ResponsesResult>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ResponsesRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResponsesClient for ScriptedClient {
        async fn create(
            &self,
            request: &ResponsesRequest,
            _text_sink: Option<&mpsc::UnboundedSender<String>>,
        ) -> Result<ResponsesResult, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::Transport("script exhausted".into()))
        }
    }

    struct RecordingTool {
        name: &'static str,
        result: Result<String, ToolError>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl crate::tool::Tool for RecordingTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::function(self.name, "test tool", serde_json::json!({}))
        }
        async fn execute(
            &self,
            _scope: &ToolScope,
            arguments: &str,
            _call_id: &str,
        ) -> Result<String, ToolError> {
            self.calls.lock().unwrap().push(arguments.to_owned());
            self.result.clone()
        }
    }

    fn text_response(text: &str) -> ResponsesResult {
        ResponsesResult {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn call_response(name: &str, call_id: &str, args: &str) -> ResponsesResult {
        ResponsesResult {
            tool_calls: vec![AssembledToolCall {
                id: Some(format!("fc_{call_id}")),
                call_id: call_id.into(),
                name: name.into(),
                arguments: args.into(),
            }],
            ..Default::default()
        }
    }

    fn build_loop(
        client: Arc<ScriptedClient>,
        tools: Vec<RecordingTool>,
    ) -> ActionLoop {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        ActionLoop::new(client, Arc::new(registry), ActionLoopOptions::new("test-model"))
    }

    #[tokio::test]
    async fn immediate_text_returns() {
        let client = ScriptedClient::new(vec![text_response("done")]);
        let action = build_loop(Arc::clone(&client), vec![]);
        let out = action
            .run(&ToolScope::default(), "hi", None, None)
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn tool_roundtrip_replays_full_context() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let client = ScriptedClient::new(vec![
            call_response("task.current.set_flag", "call_1", r#"{"flag":"success"}"#),
            text_response("flagged"),
        ]);
        let action = build_loop(
            Arc::clone(&client),
            vec![RecordingTool {
                name: "task.current.set_flag",
                result: Ok(r#"{"ok":true}"#.into()),
                calls: Arc::clone(&calls),
            }],
        );

        let out = action
            .run(&ToolScope::default(), "set the flag", None, None)
            .await
            .unwrap();
        assert_eq!(out, "flagged");
        assert_eq!(calls.lock().unwrap().len(), 1);

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        // Second request carries the whole conversation, never a
        // previous_response_id.
        let second = &requests[1];
        assert_eq!(second.input.len(), 3);
        assert!(matches!(&second.input[0], InputItem::Message { role, .. } if role == "user"));
        match &second.input[1] {
            InputItem::FunctionCall { name, call_id, .. } => {
                // Replayed names are sanitized for strict validators.
                assert_eq!(name, "task_current_set_flag");
                assert_eq!(call_id, "call_1");
            }
            other => panic!("expected FunctionCall, got {other:?}"),
        }
        match &second.input[2] {
            InputItem::FunctionCallOutput { call_id, output } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(output, r#"{"ok":true}"#);
            }
            other => panic!("expected FunctionCallOutput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn allowlist_rejection_synthesizes_output_and_continues() {
        let stdin_calls = Arc::new(Mutex::new(Vec::new()));
        let client = ScriptedClient::new(vec![
            call_response("write_stdin", "call_1", r#"{"input":"y\r"}"#),
            text_response("recovered"),
        ]);
        let action = build_loop(
            Arc::clone(&client),
            vec![
                RecordingTool {
                    name: "write_stdin",
                    result: Ok("never".into()),
                    calls: Arc::clone(&stdin_calls),
                },
                RecordingTool {
                    name: "exec_command",
                    result: Ok("ok".into()),
                    calls: Arc::new(Mutex::new(Vec::new())),
                },
            ],
        );

        let allowlist = Allowlist::Static(vec!["exec_command".into()]);
        let out = action
            .run(&ToolScope::default(), "run it", Some(&allowlist), None)
            .await
            .unwrap();
        assert_eq!(out, "recovered");
        assert!(stdin_calls.lock().unwrap().is_empty(), "tool never invoked");

        // The synthesized output is a JSON error envelope.
        let requests = client.requests();
        let InputItem::FunctionCallOutput { output, .. } = &requests[1].input[2] else {
            panic!("expected FunctionCallOutput");
        };
        let parsed: serde_json::Value = serde_json::from_str(output).unwrap();
        assert!(!parsed["error"].as_str().unwrap().is_empty());
        assert!(!parsed["suggest"].as_str().unwrap().is_empty());

        // Only the allowlisted tool spec went out.
        assert_eq!(requests[0].tools.len(), 1);
        assert_eq!(requests[0].tools[0].name, "exec_command");
    }

    #[tokio::test]
    async fn missing_tool_yields_tool_not_found_output() {
        let client = ScriptedClient::new(vec![
            call_response("no_such_tool", "call_1", "{}"),
            text_response("ok"),
        ]);
        let action = build_loop(Arc::clone(&client), vec![]);
        action
            .run(&ToolScope::default(), "go", None, None)
            .await
            .unwrap();

        let requests = client.requests();
        let InputItem::FunctionCallOutput { output, .. } = &requests[1].input[2] else {
            panic!("expected FunctionCallOutput");
        };
        assert!(output.contains(TOOL_NOT_FOUND));
    }

    #[tokio::test]
    async fn tool_error_maps_to_error_envelope() {
        let client = ScriptedClient::new(vec![
            call_response("exec_command", "call_1", r#"{"command":""}"#),
            text_response("ok"),
        ]);
        let action = build_loop(
            Arc::clone(&client),
            vec![RecordingTool {
                name: "exec_command",
                result: Err(ToolError::new("command must not be empty", "pass a command")),
                calls: Arc::new(Mutex::new(Vec::new())),
            }],
        );
        action.run(&ToolScope::default(), "go", None, None).await.unwrap();

        let requests = client.requests();
        let InputItem::FunctionCallOutput { output, .. } = &requests[1].input[2] else {
            panic!("expected FunctionCallOutput");
        };
        assert!(output.contains("command must not be empty"));
        assert!(output.contains("pass a command"));
    }

    #[tokio::test]
    async fn empty_call_id_is_fatal() {
        let client = ScriptedClient::new(vec![ResponsesResult {
            tool_calls: vec![AssembledToolCall {
                id: None,
                call_id: String::new(),
                name: "exec_command".into(),
                arguments: "{}".into(),
            }],
            ..Default::default()
        }]);
        let action = build_loop(client, vec![]);
        let err = action
            .run(&ToolScope::default(), "go", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::EmptyCallId));
    }

    #[tokio::test]
    async fn no_output_carries_event_trace() {
        let client = ScriptedClient::new(vec![ResponsesResult {
            event_trace: vec!["response.created".into(), "response.completed".into()],
            ..Default::default()
        }]);
        let action = build_loop(client, vec![]);
        let err = action
            .run(&ToolScope::default(), "go", None, None)
            .await
            .unwrap_err();
        match err {
            LlmError::NoOutput { trace } => {
                assert!(trace.contains("response.created"));
                assert!(trace.contains("response.completed"));
            }
            other => panic!("expected NoOutput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn iteration_cap_is_enforced() {
        let endless: Vec<ResponsesResult> = (0..10)
            .map(|i| call_response("exec_command", &format!("call_{i}"), "{}"))
            .collect();
        let client = ScriptedClient::new(endless);
        let mut action = build_loop(
            Arc::clone(&client),
            vec![RecordingTool {
                name: "exec_command",
                result: Ok("ok".into()),
                calls: Arc::new(Mutex::new(Vec::new())),
            }],
        );
        action.opts.max_iterations = 3;

        let err = action
            .run(&ToolScope::default(), "go", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MaxIterations(3)));
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn resolver_allowlist_is_reevaluated_each_iteration() {
        let flip = Arc::new(Mutex::new(false));
        let flip_inner = Arc::clone(&flip);
        let allowlist = Allowlist::Resolver(Arc::new(move || {
            let mut switched = flip_inner.lock().unwrap();
            if *switched {
                vec!["write_stdin".to_owned()]
            } else {
                *switched = true;
                vec!["exec_command".to_owned()]
            }
        }));

        let client = ScriptedClient::new(vec![
            call_response("exec_command", "call_1", "{}"),
            text_response("done"),
        ]);
        let action = build_loop(
            Arc::clone(&client),
            vec![
                RecordingTool {
                    name: "exec_command",
                    result: Ok("ok".into()),
                    calls: Arc::new(Mutex::new(Vec::new())),
                },
                RecordingTool {
                    name: "write_stdin",
                    result: Ok("ok".into()),
                    calls: Arc::new(Mutex::new(Vec::new())),
                },
            ],
        );

        action
            .run(&ToolScope::default(), "go", Some(&allowlist), None)
            .await
            .unwrap();

        let requests = client.requests();
        assert_eq!(requests[0].tools[0].name, "exec_command");
        assert_eq!(requests[1].tools[0].name, "write_stdin");
    }

    #[test]
    fn raw_shell_mode_detection() {
        let raw = vec!["exec_command".to_owned(), "readfile".to_owned()];
        assert!(Allowlist::raw_shell_mode(&raw));
        let interactive = vec!["exec_command".to_owned(), "task.input_prompt".to_owned()];
        assert!(!Allowlist::raw_shell_mode(&interactive));
        assert!(!Allowlist::raw_shell_mode(&[]));
    }
}

//! HTTP implementation of [`ResponsesClient`] over a responses-style
//! endpoint, with SSE streaming support.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::client::{LlmError, ResponsesClient};
use crate::types::{AssembledToolCall, ResponsesRequest, ResponsesResult};

pub struct HttpResponsesClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpResponsesClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url.trim_end_matches('/'))
    }

    async fn send(
        &self,
        request: &ResponsesRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| LlmError::Transport(format!("encode request: {e}")))?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".into(), serde_json::Value::Bool(stream));
        }

        let mut builder = self.http.post(self.endpoint()).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ResponsesClient for HttpResponsesClient {
    async fn create(
        &self,
        request: &ResponsesRequest,
        text_sink: Option<&mpsc::UnboundedSender<String>>,
    ) -> Result<ResponsesResult, LlmError> {
        match text_sink {
            Some(sink) => {
                let response = self.send(request, true).await?;
                consume_sse(response, sink).await
            }
            None => {
                let response = self.send(request, false).await?;
                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| LlmError::Transport(e.to_string()))?;
                Ok(parse_complete_response(&body))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Non-streaming parse
// ---------------------------------------------------------------------------

fn parse_complete_response(body: &serde_json::Value) -> ResponsesResult {
    let mut result = ResponsesResult::default();
    let Some(output) = body.get("output").and_then(|v| v.as_array()) else {
        return result;
    };
    for item in output {
        let kind = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
        result.event_trace.push(format!("output:{kind}"));
        match kind {
            "message" => {
                let mut text = String::new();
                if let Some(content) = item.get("content").and_then(|v| v.as_array()) {
                    for part in content {
                        if part.get("type").and_then(|v| v.as_str()) == Some("output_text") {
                            if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                                text.push_str(t);
                            }
                        }
                    }
                }
                if !text.is_empty() {
                    result.text = Some(text);
                }
            }
            "function_call" => {
                result.tool_calls.push(AssembledToolCall {
                    id: item.get("id").and_then(|v| v.as_str()).map(String::from),
                    call_id: item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned(),
                    name: item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned(),
                    arguments: item
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned(),
                });
            }
            _ => {}
        }
    }
    result
}

// ---------------------------------------------------------------------------
// SSE streaming parse
// ---------------------------------------------------------------------------

async fn consume_sse(
    response: reqwest::Response,
    sink: &mpsc::UnboundedSender<String>,
) -> Result<ResponsesResult, LlmError> {
    let mut result = ResponsesResult::default();
    let mut text = String::new();
    let mut buffer = String::new();

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| LlmError::Transport(e.to_string()))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_owned();
            buffer.drain(..pos + 2);
            handle_sse_event(&event, &mut result, &mut text, sink);
        }
    }
    if !buffer.trim().is_empty() {
        handle_sse_event(&buffer.clone(), &mut result, &mut text, sink);
    }

    if !text.is_empty() {
        result.text = Some(text);
    }
    Ok(result)
}

fn handle_sse_event(
    event: &str,
    result: &mut ResponsesResult,
    text: &mut String,
    sink: &mpsc::UnboundedSender<String>,
) {
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            continue;
        };
        if data == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
        result.event_trace.push(kind.to_owned());
        match kind {
            "response.output_text.delta" => {
                if let Some(delta) = value.get("delta").and_then(|v| v.as_str()) {
                    text.push_str(delta);
                    let _ = sink.send(delta.to_owned());
                }
            }
            "response.output_item.added" => {
                let Some(item) = value.get("item") else { continue };
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    result.tool_calls.push(AssembledToolCall {
                        id: item.get("id").and_then(|v| v.as_str()).map(String::from),
                        call_id: item
                            .get("call_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_owned(),
                        name: item
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_owned(),
                        arguments: item
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_owned(),
                    });
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(delta) = value.get("delta").and_then(|v| v.as_str()) {
                    if let Some(call) = result.tool_calls.last_mut() {
                        call.arguments.push_str(delta);
                    }
                }
            }
            "response.output_item.done" => {
                // The done item carries the authoritative call_id/arguments.
                let Some(item) = value.get("item") else { continue };
                if item.get("type").and_then(|v| v.as_str()) != Some("function_call") {
                    continue;
                }
                let call_id = item.get("call_id").and_then(|v| v.as_str()).unwrap_or("");
                if let Some(call) = result
                    .tool_calls
                    .iter_mut()
                    .rev()
                    .find(|c| c.call_id == call_id || c.call_id.is_empty())
                {
                    if call.call_id.is_empty() {
                        call.call_id = call_id.to_owned();
                    }
                    if let Some(args) = item.get("arguments").and_then(|v| v.as_str()) {
                        if !args.is_empty() {
                            call.arguments = args.to_owned();
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_complete_text_response() {
        let body = serde_json::json!({
            "output": [
                { "type": "message", "content": [
                    { "type": "output_text", "text": "all " },
                    { "type": "output_text", "text": "done" },
                ]},
            ],
        });
        let result = parse_complete_response(&body);
        assert_eq!(result.text.as_deref(), Some("all done"));
        assert!(result.tool_calls.is_empty());
    }

    #[test]
    fn parse_complete_tool_call_response() {
        let body = serde_json::json!({
            "output": [
                {
                    "type": "function_call",
                    "id": "fc_1",
                    "call_id": "call_9",
                    "name": "exec_command",
                    "arguments": "{\"command\":\"ls\"}",
                },
            ],
        });
        let result = parse_complete_response(&body);
        assert!(result.text.is_none());
        assert_eq!(result.tool_calls.len(), 1);
        let call = &result.tool_calls[0];
        assert_eq!(call.id.as_deref(), Some("fc_1"));
        assert_eq!(call.call_id, "call_9");
        assert_eq!(call.name, "exec_command");
        assert!(call.arguments.contains("ls"));
    }

    #[test]
    fn sse_text_deltas_accumulate_and_forward() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut result = ResponsesResult::default();
        let mut text = String::new();

        handle_sse_event(
            r#"data: {"type":"response.output_text.delta","delta":"hel"}"#,
            &mut result,
            &mut text,
            &tx,
        );
        handle_sse_event(
            r#"data: {"type":"response.output_text.delta","delta":"lo"}"#,
            &mut result,
            &mut text,
            &tx,
        );

        assert_eq!(text, "hello");
        assert_eq!(rx.try_recv().unwrap(), "hel");
        assert_eq!(rx.try_recv().unwrap(), "lo");
        assert_eq!(result.event_trace.len(), 2);
    }

    #[test]
    fn sse_tool_call_assembles_from_deltas() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut result = ResponsesResult::default();
        let mut text = String::new();

        handle_sse_event(
            r#"data: {"type":"response.output_item.added","item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"readfile","arguments":""}}"#,
            &mut result,
            &mut text,
            &tx,
        );
        handle_sse_event(
            r#"data: {"type":"response.function_call_arguments.delta","delta":"{\"path\":"}"#,
            &mut result,
            &mut text,
            &tx,
        );
        handle_sse_event(
            r#"data: {"type":"response.function_call_arguments.delta","delta":"\"/tmp/x\"}"}"#,
            &mut result,
            &mut text,
            &tx,
        );

        assert_eq!(result.tool_calls.len(), 1);
        let call = &result.tool_calls[0];
        assert_eq!(call.call_id, "call_1");
        assert_eq!(call.name, "readfile");
        assert_eq!(call.arguments, r#"{"path":"/tmp/x"}"#);
    }

    #[test]
    fn sse_done_item_overrides_arguments() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut result = ResponsesResult::default();
        let mut text = String::new();

        handle_sse_event(
            r#"data: {"type":"response.output_item.added","item":{"type":"function_call","call_id":"call_1","name":"readfile","arguments":""}}"#,
            &mut result,
            &mut text,
            &tx,
        );
        handle_sse_event(
            r#"data: {"type":"response.output_item.done","item":{"type":"function_call","call_id":"call_1","name":"readfile","arguments":"{\"path\":\"/etc/hosts\"}"}}"#,
            &mut result,
            &mut text,
            &tx,
        );

        assert_eq!(result.tool_calls[0].arguments, r#"{"path":"/etc/hosts"}"#);
    }

    #[test]
    fn sse_ignores_done_marker_and_garbage() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut result = ResponsesResult::default();
        let mut text = String::new();

        handle_sse_event("data: [DONE]", &mut result, &mut text, &tx);
        handle_sse_event("data: not-json", &mut result, &mut text, &tx);
        handle_sse_event(": keepalive comment", &mut result, &mut text, &tx);

        assert!(result.tool_calls.is_empty());
        assert!(text.is_empty());
    }
}

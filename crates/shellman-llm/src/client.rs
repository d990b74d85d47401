//! Responses client seam.
//!
//! The action loop talks to a boxed [`ResponsesClient`] so tests can
//! script exchanges deterministically and production can swap transports
//! without touching the loop.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{ResponsesRequest, ResponsesResult};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("tool call has an empty call_id")]
    EmptyCallId,
    #[error("model produced neither text nor tool calls; events: [{trace}]")]
    NoOutput { trace: String },
    #[error("action loop exceeded {0} iterations")]
    MaxIterations(usize),
    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),
}

#[async_trait]
pub trait ResponsesClient: Send + Sync {
    /// Run one request to completion. When `text_sink` is present the
    /// transport streams and forwards text deltas as they arrive; the
    /// returned result is the assembled final state either way.
    async fn create(
        &self,
        request: &ResponsesRequest,
        text_sink: Option<&mpsc::UnboundedSender<String>>,
    ) -> Result<ResponsesResult, LlmError>;
}

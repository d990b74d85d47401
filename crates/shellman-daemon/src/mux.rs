//! WebSocket multiplexing helpers.
//!
//! One physical socket carries traffic for every logical conn. Outbound
//! frames are wrapped in a `{conn_id, data}` envelope; inbound frames that
//! decode as an envelope are routed to that conn, anything else is a
//! broadcast (legacy events carry no target conn).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;

use shellman_core::protocol::decode_envelope;

/// Upper bound for a single inbound message.
pub const READ_LIMIT_BYTES: usize = 1024 * 1024;

/// How long one physical write may take before it is abandoned.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Envelope frame scoped to one conn: `(conn_id, inner json)`.
    PerConn(String, String),
    /// Not an envelope; deliver to every conn of the turn.
    Broadcast(String),
}

pub fn route_frame(frame: &str) -> Inbound {
    match decode_envelope(frame) {
        Some((conn_id, inner)) => Inbound::PerConn(conn_id, inner),
        None => Inbound::Broadcast(frame.to_owned()),
    }
}

// ---------------------------------------------------------------------------
// Shared frame sink
// ---------------------------------------------------------------------------

/// Serialized access to a physical peer. Conn writer tasks all write
/// through one of these; the implementation owns the per-peer write lock.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), String>;
}

/// Real peer: a tungstenite sink behind an async mutex with a write
/// timeout so one slow peer cannot wedge every conn writer.
pub struct WsPeer<S> {
    sink: AsyncMutex<S>,
}

impl<S> WsPeer<S>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send,
{
    pub fn new(sink: S) -> Self {
        Self {
            sink: AsyncMutex::new(sink),
        }
    }
}

#[async_trait]
impl<S> FrameSink for WsPeer<S>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send,
{
    async fn send(&self, frame: String) -> Result<(), String> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(frame.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("write timeout".to_owned()),
        }
    }
}

/// Swappable sink: the agent loop replaces the inner peer on reconnect
/// while conn writers keep their handle. Frames sent with no peer
/// attached are lost (and counted against no one).
#[derive(Default)]
pub struct SharedSink {
    inner: std::sync::Mutex<Option<Arc<dyn FrameSink>>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: Arc<dyn FrameSink>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(sink);
    }

    pub fn detach(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    fn current(&self) -> Option<Arc<dyn FrameSink>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl FrameSink for SharedSink {
    async fn send(&self, frame: String) -> Result<(), String> {
        match self.current() {
            Some(sink) => sink.send(frame).await,
            None => Err("no peer attached".to_owned()),
        }
    }
}

// ---------------------------------------------------------------------------
// Test sink
// ---------------------------------------------------------------------------

/// Collects frames in memory; shared by actor tests across the crate.
#[derive(Default)]
pub struct CollectingSink {
    frames: std::sync::Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl FrameSink for CollectingSink {
    async fn send(&self, frame: String) -> Result<(), String> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

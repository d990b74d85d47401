//! WebSocket hub: pairs one agent with N clients per turn.
//!
//! Endpoints are `/ws/agent/<turn_id>` and `/ws/client/<turn_id>`. Every
//! client frame is forwarded to the turn's agent wrapped in a mux
//! envelope with a server-assigned conn id (`conn_1`, `conn_2`, …).
//! Agent frames that carry an envelope go to exactly that client; raw
//! frames are broadcast to every client of the turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use shellman_core::protocol::{decode_envelope, encode_envelope};

use crate::mux::READ_LIMIT_BYTES;

// ---------------------------------------------------------------------------
// Endpoint parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Agent(String),
    Client(String),
}

pub fn parse_endpoint(path: &str) -> Option<Endpoint> {
    let rest = path.strip_prefix("/ws/")?;
    let (kind, turn_id) = rest.split_once('/')?;
    if turn_id.is_empty() || turn_id.contains('/') {
        return None;
    }
    match kind {
        "agent" => Some(Endpoint::Agent(turn_id.to_owned())),
        "client" => Some(Endpoint::Client(turn_id.to_owned())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Hub state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TurnState {
    agent_tx: Option<mpsc::UnboundedSender<Message>>,
    clients: HashMap<String, mpsc::UnboundedSender<Message>>,
    next_conn: u64,
}

#[derive(Default)]
pub struct Hub {
    turns: Mutex<HashMap<String, TurnState>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TurnState>> {
        self.turns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach the turn's agent; a newer agent replaces an older one.
    pub fn register_agent(&self, turn_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut turns = self.lock();
        let turn = turns.entry(turn_id.to_owned()).or_default();
        turn.agent_tx = Some(tx);
        rx
    }

    pub fn unregister_agent(&self, turn_id: &str) {
        let mut turns = self.lock();
        if let Some(turn) = turns.get_mut(turn_id) {
            turn.agent_tx = None;
        }
    }

    /// Attach a client; returns its server-assigned conn id.
    pub fn register_client(&self, turn_id: &str) -> (String, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut turns = self.lock();
        let turn = turns.entry(turn_id.to_owned()).or_default();
        turn.next_conn += 1;
        let conn_id = format!("conn_{}", turn.next_conn);
        turn.clients.insert(conn_id.clone(), tx);
        (conn_id, rx)
    }

    pub fn unregister_client(&self, turn_id: &str, conn_id: &str) {
        let mut turns = self.lock();
        if let Some(turn) = turns.get_mut(turn_id) {
            turn.clients.remove(conn_id);
        }
    }

    /// Client frame: wrap and forward to the agent.
    pub fn on_client_frame(&self, turn_id: &str, conn_id: &str, text: &str) {
        let frame = match encode_envelope(conn_id, text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(turn_id, conn_id, error = %e, "hub: client frame not wrappable");
                return;
            }
        };
        let turns = self.lock();
        let Some(agent_tx) = turns.get(turn_id).and_then(|t| t.agent_tx.as_ref()) else {
            tracing::debug!(turn_id, "hub: no agent attached, client frame dropped");
            return;
        };
        let _ = agent_tx.send(Message::Text(frame.into()));
    }

    /// Agent frame: envelope routes to one client, raw broadcasts.
    pub fn on_agent_frame(&self, turn_id: &str, text: &str) {
        let turns = self.lock();
        let Some(turn) = turns.get(turn_id) else { return };
        match decode_envelope(text) {
            Some((conn_id, inner)) => {
                if let Some(client) = turn.clients.get(&conn_id) {
                    let _ = client.send(Message::Text(inner.into()));
                }
            }
            None => {
                for client in turn.clients.values() {
                    let _ = client.send(Message::Text(text.to_owned().into()));
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn client_count(&self, turn_id: &str) -> usize {
        self.lock().get(turn_id).map_or(0, |t| t.clients.len())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accept loop; spawns one handler per socket until cancelled.
pub async fn run_hub(
    listener: TcpListener,
    hub: Arc<Hub>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "ws hub listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let hub = Arc::clone(&hub);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_socket(stream, hub, cancel).await {
                                tracing::debug!(peer = %peer, error = %e, "hub: socket handler finished");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "hub: accept failed"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    Ok(())
}

async fn handle_socket(
    stream: TcpStream,
    hub: Arc<Hub>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = None;
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(READ_LIMIT_BYTES);
    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, resp: Response| {
            path = Some(req.uri().path().to_owned());
            Ok(resp)
        },
        Some(config),
    )
    .await?;

    let Some(endpoint) = path.as_deref().and_then(parse_endpoint) else {
        tracing::debug!(path = ?path, "hub: unknown ws path");
        return Ok(());
    };

    let (mut ws_tx, mut ws_rx) = ws.split();
    match endpoint {
        Endpoint::Agent(turn_id) => {
            tracing::info!(turn_id, "hub: agent attached");
            let mut out_rx = hub.register_agent(&turn_id);
            loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(msg) => {
                            if ws_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    msg = ws_rx.next() => match msg {
                        Some(Ok(Message::Text(text))) => hub.on_agent_frame(&turn_id, &text),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(turn_id, error = %e, "hub: agent read error");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
            hub.unregister_agent(&turn_id);
            tracing::info!(turn_id, "hub: agent detached");
        }
        Endpoint::Client(turn_id) => {
            let (conn_id, mut out_rx) = hub.register_client(&turn_id);
            tracing::info!(turn_id, conn_id, "hub: client attached");
            loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(msg) => {
                            if ws_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    msg = ws_rx.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            hub.on_client_frame(&turn_id, &conn_id, &text);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(turn_id, conn_id, error = %e, "hub: client read error");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
            hub.unregister_client(&turn_id, &conn_id);
            tracing::info!(turn_id, conn_id, "hub: client detached");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("/ws/agent/turn-1"),
            Some(Endpoint::Agent("turn-1".into()))
        );
        assert_eq!(
            parse_endpoint("/ws/client/turn-1"),
            Some(Endpoint::Client("turn-1".into()))
        );
        assert_eq!(parse_endpoint("/ws/other/turn-1"), None);
        assert_eq!(parse_endpoint("/ws/agent/"), None);
        assert_eq!(parse_endpoint("/healthz"), None);
        assert_eq!(parse_endpoint("/ws/agent/a/b"), None);
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn client_frames_are_wrapped_toward_agent() {
        let hub = Hub::new();
        let mut agent_rx = hub.register_agent("t1");
        let (conn_id, _client_rx) = hub.register_client("t1");
        assert_eq!(conn_id, "conn_1");

        hub.on_client_frame("t1", &conn_id, r#"{"id":"1","type":"req","op":"tmux.list"}"#);
        let frame = text_of(agent_rx.try_recv().unwrap());
        let (decoded_conn, inner) = decode_envelope(&frame).unwrap();
        assert_eq!(decoded_conn, "conn_1");
        assert!(inner.contains("tmux.list"));
    }

    #[test]
    fn conn_ids_are_assigned_sequentially() {
        let hub = Hub::new();
        let (c1, _r1) = hub.register_client("t1");
        let (c2, _r2) = hub.register_client("t1");
        assert_eq!(c1, "conn_1");
        assert_eq!(c2, "conn_2");
        // A different turn starts its own sequence.
        let (other, _r3) = hub.register_client("t2");
        assert_eq!(other, "conn_1");
    }

    #[test]
    fn enveloped_agent_frame_reaches_only_its_client() {
        let hub = Hub::new();
        let _agent_rx = hub.register_agent("t1");
        let (c1, mut rx1) = hub.register_client("t1");
        let (_c2, mut rx2) = hub.register_client("t1");

        let inner = r#"{"id":"1","type":"res","op":"tmux.list","payload":{}}"#;
        let frame = encode_envelope(&c1, inner).unwrap();
        hub.on_agent_frame("t1", &frame);

        assert_eq!(text_of(rx1.try_recv().unwrap()), inner);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn raw_agent_frame_broadcasts_to_all_clients() {
        let hub = Hub::new();
        let (_c1, mut rx1) = hub.register_client("t1");
        let (_c2, mut rx2) = hub.register_client("t1");

        let event = r#"{"id":"","type":"event","op":"tmux.status","payload":{}}"#;
        hub.on_agent_frame("t1", event);

        assert_eq!(text_of(rx1.try_recv().unwrap()), event);
        assert_eq!(text_of(rx2.try_recv().unwrap()), event);
    }

    #[test]
    fn frames_without_agent_are_dropped() {
        let hub = Hub::new();
        let (conn_id, _rx) = hub.register_client("t1");
        // No agent attached; nothing panics, frame is simply lost.
        hub.on_client_frame("t1", &conn_id, "{}");
        hub.unregister_client("t1", &conn_id);
        assert_eq!(hub.client_count("t1"), 0);
    }
}

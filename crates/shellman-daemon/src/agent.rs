//! Agent-side WebSocket loop and op dispatch.
//!
//! The agent dials the hub's `/ws/agent/<turn_id>` endpoint, attaches the
//! physical peer to the shared sink the conn writers feed, and routes
//! inbound frames: enveloped frames to their conn's handler, raw frames
//! to every conn. Transport failures reconnect with a short backoff and
//! are never fatal to the process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use shellman_core::input::InputTracker;
use shellman_core::protocol::{
    Msg, MsgKind, OP_GATEWAY_HTTP, OP_TERM_INPUT, OP_TERM_RESIZE, OP_TMUX_CREATE_CHILD_PANE,
    OP_TMUX_CREATE_SIBLING_PANE, OP_TMUX_LIST, OP_TMUX_SELECT_PANE,
};
use shellman_tmux::{TmuxError, TmuxFacade};

use crate::conn::Outbound;
use crate::gateway::{GatewayClient, GatewayRequest};
use crate::mux::{route_frame, Inbound, SharedSink, WsPeer, READ_LIMIT_BYTES};
use crate::pane::SubscribeOptions;
use crate::registry::Registry;

const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Agent WS URL for a turn, derived from an HTTP base URL.
pub fn agent_ws_url(base_url: &str, turn_id: &str) -> String {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else if base_url.starts_with("http://") {
        base_url.replacen("http://", "ws://", 1)
    } else if base_url.starts_with("ws://") || base_url.starts_with("wss://") {
        base_url.to_owned()
    } else {
        format!("ws://{base_url}")
    };
    format!("{}/ws/agent/{turn_id}", ws_base.trim_end_matches('/'))
}

pub struct AgentDeps {
    pub registry: Arc<Registry>,
    pub tmux: Arc<dyn TmuxFacade>,
    pub gateway: Option<GatewayClient>,
    pub input_tracker: Arc<Mutex<InputTracker>>,
}

// ---------------------------------------------------------------------------
// Op payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SelectPanePayload {
    target: String,
    #[serde(default)]
    cols: Option<u32>,
    #[serde(default)]
    rows: Option<u32>,
    #[serde(default)]
    gap_recover: bool,
}

#[derive(Debug, Deserialize)]
struct CreatePanePayload {
    target: String,
    #[serde(default)]
    dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TermInputPayload {
    target: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct TermResizePayload {
    target: String,
    cols: u32,
    rows: u32,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Handle one inbound frame for one conn; the response (or error) is
/// enqueued on that conn's outbound queue.
pub async fn dispatch(deps: &AgentDeps, conn_id: &str, text: &str) {
    let msg: Msg = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(conn_id, error = %e, "agent: unparseable frame ignored");
            return;
        }
    };
    if msg.kind != MsgKind::Req {
        return;
    }

    let conn = deps.registry.ensure_conn(conn_id);
    let response = handle_request(deps, conn_id, &msg).await;
    conn.enqueue(Outbound::response(response));
}

async fn handle_request(deps: &AgentDeps, conn_id: &str, msg: &Msg) -> Msg {
    match msg.op.as_str() {
        OP_TMUX_LIST => match deps.tmux.list_sessions().await {
            Ok(listings) => {
                let panes: Vec<serde_json::Value> = listings
                    .into_iter()
                    .map(|l| {
                        serde_json::json!({
                            "target": l.target,
                            "pane_id": l.pane_id,
                            "session": l.session,
                        })
                    })
                    .collect();
                Msg::response(msg, serde_json::json!({ "panes": panes }))
            }
            Err(e) => tmux_error_response(msg, &e),
        },

        OP_TMUX_SELECT_PANE => {
            let payload: SelectPanePayload = match serde_json::from_value(msg.payload.clone()) {
                Ok(p) => p,
                Err(e) => return Msg::error_response(msg, "BAD_REQUEST", e.to_string()),
            };
            if let (Some(cols), Some(rows)) = (payload.cols, payload.rows) {
                if let Err(e) = deps.tmux.resize(&payload.target, cols, rows).await {
                    tracing::debug!(target = %payload.target, error = %e, "select: resize failed");
                }
            }
            deps.registry
                .subscribe(
                    conn_id,
                    &payload.target,
                    SubscribeOptions {
                        gap_recover: payload.gap_recover,
                    },
                )
                .await;
            Msg::response(msg, serde_json::json!({ "target": payload.target }))
        }

        OP_TMUX_CREATE_SIBLING_PANE => {
            let payload: CreatePanePayload = match serde_json::from_value(msg.payload.clone()) {
                Ok(p) => p,
                Err(e) => return Msg::error_response(msg, "BAD_REQUEST", e.to_string()),
            };
            let created = match payload.dir.as_deref() {
                Some(dir) => {
                    deps.tmux
                        .create_sibling_pane_in_dir(&payload.target, dir)
                        .await
                }
                None => deps.tmux.create_sibling_pane(&payload.target).await,
            };
            match created {
                Ok(target) => Msg::response(msg, serde_json::json!({ "target": target })),
                Err(e) => tmux_error_response(msg, &e),
            }
        }

        OP_TMUX_CREATE_CHILD_PANE => {
            let payload: CreatePanePayload = match serde_json::from_value(msg.payload.clone()) {
                Ok(p) => p,
                Err(e) => return Msg::error_response(msg, "BAD_REQUEST", e.to_string()),
            };
            let created = match payload.dir.as_deref() {
                Some(dir) => {
                    deps.tmux
                        .create_child_pane_in_dir(&payload.target, dir)
                        .await
                }
                None => deps.tmux.create_child_pane(&payload.target).await,
            };
            match created {
                Ok(target) => Msg::response(msg, serde_json::json!({ "target": target })),
                Err(e) => tmux_error_response(msg, &e),
            }
        }

        OP_TERM_INPUT => {
            let payload: TermInputPayload = match serde_json::from_value(msg.payload.clone()) {
                Ok(p) => p,
                Err(e) => return Msg::error_response(msg, "BAD_REQUEST", e.to_string()),
            };
            {
                let mut tracker = deps
                    .input_tracker
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                tracker.record(&payload.target, Utc::now());
            }
            match deps.tmux.send_input(&payload.target, &payload.text).await {
                Ok(()) => Msg::response(msg, serde_json::json!({ "ok": true })),
                Err(e) => tmux_error_response(msg, &e),
            }
        }

        OP_TERM_RESIZE => {
            let payload: TermResizePayload = match serde_json::from_value(msg.payload.clone()) {
                Ok(p) => p,
                Err(e) => return Msg::error_response(msg, "BAD_REQUEST", e.to_string()),
            };
            match deps
                .tmux
                .resize(&payload.target, payload.cols, payload.rows)
                .await
            {
                Ok(()) => Msg::response(msg, serde_json::json!({ "ok": true })),
                Err(e) => tmux_error_response(msg, &e),
            }
        }

        OP_GATEWAY_HTTP => {
            let Some(gateway) = &deps.gateway else {
                return Msg::error_response(msg, "GATEWAY_UNAVAILABLE", "no worker base url configured");
            };
            let payload: GatewayRequest = match serde_json::from_value(msg.payload.clone()) {
                Ok(p) => p,
                Err(e) => return Msg::error_response(msg, "BAD_REQUEST", e.to_string()),
            };
            let active = deps
                .registry
                .get_conn(conn_id)
                .and_then(|c| c.selected_target());
            match gateway.execute(payload, active.as_deref()).await {
                Ok(response) => Msg::response(
                    msg,
                    serde_json::to_value(&response).unwrap_or(serde_json::Value::Null),
                ),
                Err(e) => Msg::error_response(msg, "GATEWAY_ERROR", e),
            }
        }

        other => Msg::error_response(msg, "UNKNOWN_OP", format!("unknown op: {other}")),
    }
}

fn tmux_error_response(msg: &Msg, err: &TmuxError) -> Msg {
    if err.is_pane_missing() {
        Msg::error_response(msg, "PANE_NOT_FOUND", err.to_string())
    } else {
        Msg::error_response(msg, "TMUX_ERROR", err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Agent loop
// ---------------------------------------------------------------------------

/// Dial the hub and serve frames until cancelled. Reconnects with a
/// 100 ms backoff on any transport failure.
pub async fn run_agent_loop(
    url: String,
    deps: Arc<AgentDeps>,
    shared_sink: Arc<SharedSink>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(READ_LIMIT_BYTES);
        match tokio_tungstenite::connect_async_with_config(&url, Some(config), false).await {
            Ok((socket, _)) => {
                tracing::info!(url = %url, "agent: connected");
                let (write, mut read) = socket.split();
                shared_sink.attach(Arc::new(WsPeer::new(write)));

                loop {
                    tokio::select! {
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                serve_frame(&deps, &text).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "agent: read error");
                                break;
                            }
                        },
                        _ = cancel.cancelled() => {
                            shared_sink.detach();
                            return;
                        }
                    }
                }
                shared_sink.detach();
                tracing::warn!("agent: disconnected, reconnecting");
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "agent: dial failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

async fn serve_frame(deps: &AgentDeps, text: &str) {
    match route_frame(text) {
        Inbound::PerConn(conn_id, inner) => dispatch(deps, &conn_id, &inner).await,
        Inbound::Broadcast(frame) => {
            // Legacy frames without a target conn reach every handler.
            for conn in deps.registry.conns() {
                dispatch(deps, conn.conn_id(), &frame).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::CollectingSink;
    use crate::registry::{RegistryDeps, RegistryOptions};
    use shellman_core::protocol::{FrameMode, TermOutput, EV_TERM_OUTPUT};
    use shellman_tmux::FakeTmux;
    use std::collections::HashMap;

    fn make_deps(tmux: Arc<FakeTmux>) -> AgentDeps {
        let input_tracker = Arc::new(Mutex::new(InputTracker::new()));
        let registry = Registry::new(
            RegistryDeps {
                tmux: Arc::clone(&tmux) as Arc<dyn TmuxFacade>,
                hub: None,
                executor: None,
                report_tx: None,
                input_tracker: Arc::clone(&input_tracker),
                baselines: HashMap::new(),
                sink: CollectingSink::new(),
            },
            RegistryOptions::default(),
            CancellationToken::new(),
        );
        AgentDeps {
            registry,
            tmux,
            gateway: None,
            input_tracker,
        }
    }

    fn req(id: &str, op: &str, payload: serde_json::Value) -> String {
        serde_json::to_string(&Msg {
            id: id.into(),
            kind: MsgKind::Req,
            op: op.into(),
            payload,
            error: None,
        })
        .unwrap()
    }

    #[test]
    fn agent_ws_url_schemes() {
        assert_eq!(
            agent_ws_url("http://127.0.0.1:4621", "local"),
            "ws://127.0.0.1:4621/ws/agent/local"
        );
        assert_eq!(
            agent_ws_url("https://worker.example.com/", "turn-9"),
            "wss://worker.example.com/ws/agent/turn-9"
        );
        assert_eq!(
            agent_ws_url("127.0.0.1:4621", "local"),
            "ws://127.0.0.1:4621/ws/agent/local"
        );
    }

    #[tokio::test]
    async fn select_pane_resizes_subscribes_and_responds() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("e2e:0.0", "hello\n");
        let deps = make_deps(Arc::clone(&tmux));

        let frame = req(
            "1",
            OP_TMUX_SELECT_PANE,
            serde_json::json!({ "target": "e2e:0.0", "cols": 120, "rows": 40 }),
        );
        dispatch(&deps, "conn_1", &frame).await;

        assert_eq!(tmux.resizes(), vec![("e2e:0.0".to_owned(), 120, 40)]);

        let conn = deps.registry.get_conn("conn_1").unwrap();
        let msgs = conn.test_drain();
        // A reset frame and the op response, in order.
        let reset: TermOutput = msgs
            .iter()
            .find(|m| m.op == EV_TERM_OUTPUT)
            .map(|m| serde_json::from_value(m.payload.clone()).unwrap())
            .expect("reset frame present");
        assert_eq!(reset.mode, FrameMode::Reset);
        assert!(reset.data.contains("hello"));

        let response = msgs
            .iter()
            .find(|m| m.kind == MsgKind::Res)
            .expect("response present");
        assert_eq!(response.id, "1");
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn term_input_records_input_time_and_forwards() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("e2e:0.0", "x");
        let deps = make_deps(Arc::clone(&tmux));

        let frame = req(
            "2",
            OP_TERM_INPUT,
            serde_json::json!({ "target": "e2e:0.0", "text": "ls\r" }),
        );
        dispatch(&deps, "conn_1", &frame).await;

        assert_eq!(tmux.sent_inputs(), vec![("e2e:0.0".to_owned(), "ls\r".to_owned())]);
        let tracker = deps.input_tracker.lock().unwrap();
        assert!(tracker.last("e2e:0.0").is_some(), "input time recorded");
    }

    #[tokio::test]
    async fn term_input_to_missing_pane_errors() {
        let tmux = Arc::new(FakeTmux::new());
        let deps = make_deps(Arc::clone(&tmux));

        let frame = req(
            "3",
            OP_TERM_INPUT,
            serde_json::json!({ "target": "gone:0.0", "text": "x" }),
        );
        dispatch(&deps, "conn_1", &frame).await;

        let conn = deps.registry.get_conn("conn_1").unwrap();
        let msgs = conn.test_drain();
        let err = msgs[0].error.as_ref().expect("error response");
        assert_eq!(err.code, "PANE_NOT_FOUND");
    }

    #[tokio::test]
    async fn tmux_list_returns_pane_targets() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("a:0.0", "");
        tmux.add_pane("a:0.1", "");
        let deps = make_deps(Arc::clone(&tmux));

        dispatch(&deps, "conn_1", &req("4", OP_TMUX_LIST, serde_json::json!({}))).await;

        let conn = deps.registry.get_conn("conn_1").unwrap();
        let msgs = conn.test_drain();
        let panes = msgs[0].payload["panes"].as_array().unwrap();
        assert_eq!(panes.len(), 2);
        assert_eq!(panes[0]["target"], "a:0.0");
    }

    #[tokio::test]
    async fn create_child_pane_returns_new_target() {
        let tmux = Arc::new(FakeTmux::new());
        tmux.add_pane("a:0.0", "");
        let deps = make_deps(Arc::clone(&tmux));

        dispatch(
            &deps,
            "conn_1",
            &req(
                "5",
                OP_TMUX_CREATE_CHILD_PANE,
                serde_json::json!({ "target": "a:0.0" }),
            ),
        )
        .await;

        let conn = deps.registry.get_conn("conn_1").unwrap();
        let msgs = conn.test_drain();
        assert_eq!(msgs[0].payload["target"], "a:0.0-child");
        assert!(tmux.pane_exists("a:0.0-child").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_op_and_gateway_without_worker_error() {
        let tmux = Arc::new(FakeTmux::new());
        let deps = make_deps(Arc::clone(&tmux));

        dispatch(&deps, "conn_1", &req("6", "no.such_op", serde_json::json!({}))).await;
        dispatch(
            &deps,
            "conn_1",
            &req("7", OP_GATEWAY_HTTP, serde_json::json!({ "method": "GET", "path": "/x" })),
        )
        .await;

        let conn = deps.registry.get_conn("conn_1").unwrap();
        let msgs = conn.test_drain();
        assert_eq!(msgs[0].error.as_ref().unwrap().code, "UNKNOWN_OP");
        assert_eq!(msgs[1].error.as_ref().unwrap().code, "GATEWAY_UNAVAILABLE");
    }

    #[tokio::test]
    async fn events_and_garbage_are_ignored() {
        let tmux = Arc::new(FakeTmux::new());
        let deps = make_deps(Arc::clone(&tmux));

        dispatch(&deps, "conn_1", "not json").await;
        let event = serde_json::to_string(&Msg::event("tmux.status", serde_json::json!({})))
            .unwrap();
        dispatch(&deps, "conn_1", &event).await;

        // Only the ensure_conn side effect may exist; no responses queued.
        if let Some(conn) = deps.registry.get_conn("conn_1") {
            assert!(conn.test_drain().is_empty());
        }
    }
}

//! Wire protocol types.
//!
//! One physical WebSocket carries traffic for many logical connections.
//! Inner messages are `Msg` values; the mux layer wraps them in a
//! [`MuxEnvelope`] keyed by `conn_id`. A frame that does not parse as an
//! envelope is treated as a broadcast to every conn of the turn.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

// ---------------------------------------------------------------------------
// Op names
// ---------------------------------------------------------------------------

pub const OP_TMUX_LIST: &str = "tmux.list";
pub const OP_TMUX_SELECT_PANE: &str = "tmux.select_pane";
pub const OP_TMUX_CREATE_SIBLING_PANE: &str = "tmux.create_sibling_pane";
pub const OP_TMUX_CREATE_CHILD_PANE: &str = "tmux.create_child_pane";
pub const OP_TERM_INPUT: &str = "term.input";
pub const OP_TERM_RESIZE: &str = "term.resize";
pub const OP_GATEWAY_HTTP: &str = "gateway.http";

pub const EV_TERM_OUTPUT: &str = "term.output";
pub const EV_PANE_ENDED: &str = "pane.ended";
pub const EV_TMUX_STATUS: &str = "tmux.status";

// ---------------------------------------------------------------------------
// Msg
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    Req,
    Res,
    Event,
}

/// Error payload carried on failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrPayload {
    pub code: String,
    pub message: String,
}

/// A single protocol message: request, response, or event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MsgKind,
    pub op: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrPayload>,
}

impl Msg {
    pub fn event(op: &str, payload: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            kind: MsgKind::Event,
            op: op.to_owned(),
            payload,
            error: None,
        }
    }

    pub fn response(req: &Msg, payload: serde_json::Value) -> Self {
        Self {
            id: req.id.clone(),
            kind: MsgKind::Res,
            op: req.op.clone(),
            payload,
            error: None,
        }
    }

    pub fn error_response(req: &Msg, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: req.id.clone(),
            kind: MsgKind::Res,
            op: req.op.clone(),
            payload: serde_json::Value::Null,
            error: Some(ErrPayload {
                code: code.to_owned(),
                message: message.into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// Frame mode for `term.output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameMode {
    /// Authoritative visible snapshot; replaces whatever the client shows.
    Reset,
    /// Incremental data appended to the client's current view.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermOutput {
    pub target: String,
    pub mode: FrameMode,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaneEnded {
    pub target: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Mux envelope
// ---------------------------------------------------------------------------

/// Wrapper distinguishing per-conn frames from broadcasts on the shared
/// socket. `data` holds the raw inner message bytes so wrap/unwrap is an
/// exact round trip.
#[derive(Debug, Serialize, Deserialize)]
pub struct MuxEnvelope<'a> {
    pub conn_id: String,
    #[serde(borrow)]
    pub data: &'a RawValue,
}

/// Wrap inner message JSON for the given conn. The inner bytes are kept
/// verbatim so wrap/unwrap round-trips exactly.
pub fn encode_envelope(conn_id: &str, inner_json: &str) -> Result<String, serde_json::Error> {
    serde_json::from_str::<&RawValue>(inner_json)?;
    let conn = serde_json::to_string(conn_id)?;
    Ok(format!(r#"{{"conn_id":{conn},"data":{inner_json}}}"#))
}

/// Decode a frame as a mux envelope. `None` means the frame is not a valid
/// envelope and must be handled as a broadcast.
pub fn decode_envelope(frame: &str) -> Option<(String, String)> {
    let env: MuxEnvelope<'_> = serde_json::from_str(frame).ok()?;
    if env.conn_id.is_empty() {
        return None;
    }
    Some((env.conn_id, env.data.get().to_owned()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

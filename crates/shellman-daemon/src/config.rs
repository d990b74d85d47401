//! Environment-driven configuration.
//!
//! Every knob lives under the `SHELLMAN_` prefix. Lookups go through a
//! snapshot cached for ten seconds so hot paths can re-read config
//! without hammering the environment on every call.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const ENV_PREFIX: &str = "SHELLMAN_";

pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: u16 = 4621;
pub const DEFAULT_HISTORY_LINES: u32 = 2000;
const CACHE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Everything co-located: the hub listens on localhost and the agent
    /// dials itself.
    Local,
    /// The agent dials a remote turn hub.
    Turn,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub worker_base_url: String,
    pub log_level: String,
    pub tmux_socket: Option<String>,
    pub trace_stream: bool,
    pub history_lines: u32,
    pub mode: Mode,
    pub local_host: String,
    pub local_port: u16,
    pub webui_mode: String,
    pub webui_proxy: String,
    pub webui_dist: String,
    pub llm_endpoint: String,
    pub llm_model: String,
    pub llm_api_key: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Build from an arbitrary lookup (tests inject maps here).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mode = match get("MODE").as_deref() {
            Some("turn") => Mode::Turn,
            _ => Mode::Local,
        };
        Self {
            worker_base_url: get("WORKER_BASE_URL").unwrap_or_default(),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            tmux_socket: get("TMUX_SOCKET").filter(|s| !s.is_empty()),
            trace_stream: matches!(get("TRACE_STREAM").as_deref(), Some("1") | Some("true")),
            history_lines: get("HISTORY_LINES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HISTORY_LINES),
            mode,
            local_host: get("LOCAL_HOST").unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_owned()),
            local_port: get("LOCAL_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LOCAL_PORT),
            webui_mode: get("WEBUI_MODE").unwrap_or_default(),
            webui_proxy: get("WEBUI_PROXY").unwrap_or_default(),
            webui_dist: get("WEBUI_DIST").unwrap_or_default(),
            llm_endpoint: get("LLM_ENDPOINT").unwrap_or_default(),
            llm_model: get("LLM_MODEL").unwrap_or_default(),
            llm_api_key: get("LLM_API_KEY").unwrap_or_default(),
        }
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Ten-second cached view over [`Config::from_env`].
pub struct ConfigCache {
    slot: Mutex<Option<(Instant, Config)>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Config {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, config)) = slot.as_ref() {
            if at.elapsed() < CACHE_TTL {
                return config.clone();
            }
        }
        let config = Config::from_env();
        *slot = Some((Instant::now(), config.clone()));
        config
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

//! HTTP tunnel for `gateway.http` ops.
//!
//! WS clients reach the worker's HTTP API through the agent; the tunnel
//! forwards the request as-is and returns the raw status/headers/body.
//! The active pane header is injected when the caller did not set one so
//! handlers know which pane the conn is looking at.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const ACTIVE_PANE_HEADER: &str = "X-Shellman-Active-Pane-Target";

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Add the active pane header unless the caller already set one (any
/// casing counts as set).
pub fn apply_active_pane_header(
    headers: &mut HashMap<String, String>,
    active_target: Option<&str>,
) {
    let Some(target) = active_target else { return };
    let already_set = headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case(ACTIVE_PANE_HEADER));
    if !already_set {
        headers.insert(ACTIVE_PANE_HEADER.to_owned(), target.to_owned());
    }
}

pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn execute(
        &self,
        mut request: GatewayRequest,
        active_target: Option<&str>,
    ) -> Result<GatewayResponse, String> {
        apply_active_pane_header(&mut request.headers, active_target);

        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| format!("bad method {}: {e}", request.method))?;
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            request.path.trim_start_matches('/'),
        );

        let mut builder = self.http.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), value.to_owned());
            }
        }
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(GatewayResponse {
            status,
            headers,
            body,
        })
    }
}

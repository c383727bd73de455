//! Connection manager — one uniform contract over both backend transports.
//!
//! The transport is chosen from the backend URL: a `/sse` path suffix means
//! the long-lived SSE transport, anything else the HTTP-POST transport.
//! Discovery, health, and the router consume the [`ToolBackend`] trait so
//! tests can inject mock backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use tg_domain::config::BackendsConfig;

use crate::http::HttpPostClient;
use crate::protocol::{JsonRpcError, ToolDef, ToolsListResult};
use crate::sse::SseClient;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors from backend transports.
#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend returned HTTP {status}")]
    Status { status: u16, body: String },

    #[error("backend session lost: {0}")]
    SessionLost(String),

    #[error("backend returned no session id")]
    MissingSessionId,

    #[error("SSE backend not connected: {0}")]
    NotConnected(String),

    #[error("failed to connect to backend: {0}")]
    ConnectFailed(String),

    #[error("timeout waiting for backend: {0}")]
    Timeout(String),

    #[error("too many requests in flight to backend: {0}")]
    Backpressure(String),

    #[error("transport reset while awaiting response")]
    TransportReset,

    #[error("upstream response parse error: {0}")]
    Parse(String),

    /// The backend's own JSON-RPC error; relayed verbatim by the router.
    #[error(transparent)]
    Upstream(JsonRpcError),
}

impl McpClientError {
    pub(crate) fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(url.to_string())
        } else if e.is_connect() {
            Self::ConnectFailed(url.to_string())
        } else {
            Self::Http(e)
        }
    }

    /// The JSON-RPC error code this error maps to at the router boundary.
    /// [`McpClientError::Upstream`] is relayed verbatim instead.
    pub fn jsonrpc_code(&self) -> i64 {
        use crate::protocol::error_codes;
        match self {
            Self::Status { .. } => error_codes::UPSTREAM_ERROR,
            Self::Parse(_) | Self::Json(_) => error_codes::PARSE_ERROR,
            Self::Upstream(e) => e.code,
            _ => error_codes::CONNECTION_ERROR,
        }
    }
}

impl From<McpClientError> for tg_domain::error::Error {
    fn from(e: McpClientError) -> Self {
        match e {
            McpClientError::Timeout(url) => tg_domain::error::Error::Timeout(url),
            other => tg_domain::error::Error::Http(other.to_string()),
        }
    }
}

/// Split a raw JSON-RPC response body into `Ok(result)` or the upstream
/// error object. A body with neither is a parse error.
pub fn unwrap_rpc(value: Value) -> Result<Value, McpClientError> {
    if let Some(error) = value.get("error") {
        let err: JsonRpcError = serde_json::from_value(error.clone())
            .map_err(|e| McpClientError::Parse(format!("malformed error object: {e}")))?;
        return Err(McpClientError::Upstream(err));
    }
    if let Some(result) = value.get("result") {
        return Ok(result.clone());
    }
    Err(McpClientError::Parse(
        "response carried neither result nor error".into(),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolBackend trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Uniform backend contract consumed by discovery, health, and the router.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Enumerate the backend's tools.
    async fn list_tools(&self, url: &str) -> Result<Vec<ToolDef>, McpClientError>;

    /// Forward a `tools/call`; returns the JSON-RPC `result` value.
    async fn call_tool(
        &self,
        url: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpClientError>;

    /// Lightweight health probe. For SSE backends this recovers the
    /// connection (reconnect + handshake) when needed.
    async fn probe(&self, url: &str) -> Result<(), McpClientError>;

    /// Whether the backend's long-lived connection is up and initialized.
    /// HTTP-POST backends have no long-lived connection and report `true`;
    /// their liveness is judged by staleness instead.
    fn is_initialized(&self, url: &str) -> bool;

    /// Tear down per-backend transport state (SSE connection or cached
    /// HTTP session).
    async fn disconnect(&self, url: &str);
}

/// Transport discriminator: a `/sse` path suffix selects the SSE transport.
pub fn is_sse_url(url: &str) -> bool {
    url.trim_end_matches('/').ends_with("/sse")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConnectionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds both transports and routes per-URL.
pub struct ConnectionManager {
    cfg: BackendsConfig,
    http: HttpPostClient,
    /// Client used for SSE streams; no overall timeout (streams are
    /// long-lived), only a connect timeout.
    sse_http: reqwest::Client,
    sse_clients: Mutex<HashMap<String, SseClient>>,
    /// Per-URL single-flight locks for SSE initialization: concurrent
    /// refreshers for the same backend share one handshake.
    sse_init: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(cfg: &BackendsConfig) -> Result<Self, McpClientError> {
        let sse_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .build()?;
        Ok(Self {
            cfg: cfg.clone(),
            http: HttpPostClient::new(cfg)?,
            sse_http,
            sse_clients: Mutex::new(HashMap::new()),
            sse_init: Mutex::new(HashMap::new()),
        })
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.call_timeout_secs)
    }

    fn sse_client(&self, url: &str) -> SseClient {
        self.sse_clients
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| SseClient::new(url, self.sse_http.clone(), &self.cfg))
            .clone()
    }

    fn init_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.sse_init
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Connect and handshake an SSE backend, coalescing concurrent callers
    /// onto one in-flight initialization.
    async fn ensure_sse_ready(&self, url: &str) -> Result<SseClient, McpClientError> {
        let client = self.sse_client(url);
        if client.is_initialized() {
            return Ok(client);
        }

        let lock = self.init_lock(url);
        let _guard = lock.lock().await;

        // Re-check under the lock: the previous holder may have finished,
        // or replaced the client entirely.
        let client = self.sse_client(url);
        if client.is_initialized() {
            return Ok(client);
        }

        if !client.is_connected() {
            client.connect().await?;
        }
        client.initialize().await?;
        Ok(client)
    }

    /// Close everything: SSE connections and cached HTTP sessions.
    pub async fn shutdown(&self) {
        let clients: Vec<SseClient> = self.sse_clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close();
        }
        self.http.close_all().await;
        tracing::info!("connection manager shut down");
    }
}

#[async_trait]
impl ToolBackend for ConnectionManager {
    async fn list_tools(&self, url: &str) -> Result<Vec<ToolDef>, McpClientError> {
        if is_sse_url(url) {
            let client = self.ensure_sse_ready(url).await?;
            let response = client
                .send_request(
                    "tools/list",
                    Some(serde_json::json!({})),
                    self.call_timeout(),
                )
                .await?;
            let result = unwrap_rpc(response)?;
            let parsed: ToolsListResult = serde_json::from_value(result).map_err(|e| {
                McpClientError::Parse(format!("invalid tools/list result from {url}: {e}"))
            })?;
            Ok(parsed.tools)
        } else {
            self.http.list_tools(url).await
        }
    }

    async fn call_tool(
        &self,
        url: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpClientError> {
        if is_sse_url(url) {
            let client = self.ensure_sse_ready(url).await?;
            let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
            let response = client
                .send_request("tools/call", Some(params), self.call_timeout())
                .await?;
            unwrap_rpc(response)
        } else {
            self.http.call_tool(url, tool_name, arguments).await
        }
    }

    async fn probe(&self, url: &str) -> Result<(), McpClientError> {
        if is_sse_url(url) {
            // Recovery doubles as the probe: reconnect + handshake if the
            // connection is not fully up.
            self.ensure_sse_ready(url).await.map(|_| ())
        } else {
            self.http.probe(url).await
        }
    }

    fn is_initialized(&self, url: &str) -> bool {
        if is_sse_url(url) {
            self.sse_clients
                .lock()
                .get(url)
                .map(SseClient::is_initialized)
                .unwrap_or(false)
        } else {
            true
        }
    }

    async fn disconnect(&self, url: &str) {
        if is_sse_url(url) {
            if let Some(client) = self.sse_clients.lock().remove(url) {
                client.close();
            }
            tracing::debug!(url, "SSE backend disconnected");
        } else {
            self.http.close_session(url).await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_urls_detected_by_path_suffix() {
        assert!(is_sse_url("http://h:8002/sse"));
        assert!(is_sse_url("http://h:8002/sse/"));
        assert!(!is_sse_url("http://h:8001/mcp"));
        assert!(!is_sse_url("http://h:8001/ssex"));
        assert!(!is_sse_url("http://sse.example.com/mcp"));
    }

    #[test]
    fn unwrap_rpc_extracts_result() {
        let value = serde_json::json!({"jsonrpc": "2.0", "id": "1", "result": {"ok": true}});
        let result = unwrap_rpc(value).unwrap();
        assert_eq!(result.get("ok").unwrap(), true);
    }

    #[test]
    fn unwrap_rpc_surfaces_upstream_error() {
        let value = serde_json::json!({
            "jsonrpc": "2.0", "id": "1",
            "error": {"code": -32602, "message": "bad params"}
        });
        match unwrap_rpc(value) {
            Err(McpClientError::Upstream(e)) => assert_eq!(e.code, -32602),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[test]
    fn unwrap_rpc_rejects_shapeless_body() {
        let value = serde_json::json!({"jsonrpc": "2.0", "id": "1"});
        assert!(matches!(
            unwrap_rpc(value),
            Err(McpClientError::Parse(_))
        ));
    }

    #[test]
    fn error_codes_follow_taxonomy() {
        use crate::protocol::error_codes;
        let timeout = McpClientError::Timeout("u".into());
        assert_eq!(timeout.jsonrpc_code(), error_codes::CONNECTION_ERROR);
        let status = McpClientError::Status {
            status: 500,
            body: String::new(),
        };
        assert_eq!(status.jsonrpc_code(), error_codes::UPSTREAM_ERROR);
        let parse = McpClientError::Parse("x".into());
        assert_eq!(parse.jsonrpc_code(), error_codes::PARSE_ERROR);
        let reset = McpClientError::TransportReset;
        assert_eq!(reset.jsonrpc_code(), error_codes::CONNECTION_ERROR);
    }
}

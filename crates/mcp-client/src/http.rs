//! HTTP-POST transport for backends whose URL does not end in `/sse`.
//!
//! Each backend gets one cached `Mcp-Session-Id`, acquired by an
//! `initialize` + `notifications/initialized` handshake. Session creation is
//! single-flight per URL: concurrent callers coalesce on a per-URL creation
//! lock so at most one `initialize` is ever in flight to a backend. HTTP 404
//! anywhere means "session lost": the cached id is dropped and the call is
//! retried once with a fresh session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use tg_domain::config::BackendsConfig;

use crate::manager::McpClientError;
use crate::protocol::{
    self, JsonRpcNotification, JsonRpcRequest, ToolDef, ToolsListResult,
    HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, PROTOCOL_VERSION,
};

/// Total attempts for a `tools/call`, including the retry after a 404.
const MAX_CALL_ATTEMPTS: u32 = 2;

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP-POST MCP transport with per-backend session caching.
pub struct HttpPostClient {
    http: reqwest::Client,
    call_timeout: Duration,
    /// `server_url → session_id` cache.
    sessions: Mutex<HashMap<String, String>>,
    /// Per-URL creation locks (single-flight session acquisition).
    creating: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HttpPostClient {
    pub fn new(cfg: &BackendsConfig) -> Result<Self, McpClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            call_timeout: Duration::from_secs(cfg.call_timeout_secs),
            sessions: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
        })
    }

    /// The cached session id for a backend, if any.
    pub fn cached_session(&self, url: &str) -> Option<String> {
        self.sessions.lock().get(url).cloned()
    }

    /// Drop the cached session for a backend.
    pub fn clear_session(&self, url: &str) {
        if self.sessions.lock().remove(url).is_some() {
            tracing::debug!(url, "cleared cached backend session");
        }
    }

    fn creation_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.creating
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Get the cached session or create one. Concurrent callers for the
    /// same URL serialize on a per-URL lock; losers pick up the winner's
    /// session from the cache.
    pub async fn get_or_create_session(&self, url: &str) -> Result<String, McpClientError> {
        // Fast path.
        if let Some(session_id) = self.cached_session(url) {
            return Ok(session_id);
        }

        let lock = self.creation_lock(url);
        let _guard = lock.lock().await;

        // Double-check after acquiring: another caller may have finished.
        if let Some(session_id) = self.cached_session(url) {
            tracing::debug!(url, "reusing session created by concurrent request");
            return Ok(session_id);
        }

        let session_id = self.create_session(url).await?;
        self.sessions
            .lock()
            .insert(url.to_string(), session_id.clone());
        Ok(session_id)
    }

    /// Perform the MCP handshake: `initialize`, read `Mcp-Session-Id` from
    /// the response headers, then `notifications/initialized`.
    async fn create_session(&self, url: &str) -> Result<String, McpClientError> {
        tracing::info!(url, "creating backend session");

        let init = JsonRpcRequest::with_random_id(
            "initialize",
            Some(serde_json::to_value(protocol::initialize_params())?),
        );

        let resp = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .json(&init)
            .timeout(INIT_TIMEOUT)
            .send()
            .await
            .map_err(|e| McpClientError::from_reqwest(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let session_id = resp
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(McpClientError::MissingSessionId)?;

        tracing::info!(url, session_id = %session_id, "backend session created");

        // Complete the handshake. A failed notification is not fatal for
        // the session; the backend already issued the id.
        let notif = JsonRpcNotification::new("notifications/initialized");
        let notif_result = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .header(HEADER_SESSION_ID, &session_id)
            .json(&notif)
            .timeout(NOTIFY_TIMEOUT)
            .send()
            .await;
        if let Err(e) = notif_result {
            tracing::warn!(url, error = %e, "failed to send initialized notification");
        }

        Ok(session_id)
    }

    /// Call a tool. One retry after a 404 (session lost) with a freshly
    /// acquired session; any other HTTP error surfaces immediately.
    pub async fn call_tool(
        &self,
        url: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpClientError> {
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });

        let mut last_err = None;
        for attempt in 1..=MAX_CALL_ATTEMPTS {
            let session_id = self.get_or_create_session(url).await?;
            let req = JsonRpcRequest::with_random_id("tools/call", Some(params.clone()));

            let resp = self
                .http
                .post(url)
                .header("Accept", "application/json")
                .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
                .header(HEADER_SESSION_ID, &session_id)
                .json(&req)
                .timeout(self.call_timeout)
                .send()
                .await
                .map_err(|e| McpClientError::from_reqwest(url, e))?;

            let status = resp.status();
            if status.as_u16() == 404 {
                // Session expired on the backend side.
                tracing::warn!(url, attempt, "backend returned 404, resetting session");
                self.clear_session(url);
                last_err = Some(McpClientError::SessionLost(url.to_string()));
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(McpClientError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let body: Value = resp
                .json()
                .await
                .map_err(|e| McpClientError::Parse(format!("invalid JSON body from {url}: {e}")))?;
            return crate::manager::unwrap_rpc(body);
        }

        Err(last_err.unwrap_or_else(|| McpClientError::SessionLost(url.to_string())))
    }

    /// Fetch the backend's tool list. The response may be plain JSON or a
    /// single-event SSE body; both are handled.
    pub async fn list_tools(&self, url: &str) -> Result<Vec<ToolDef>, McpClientError> {
        let session_id = self.get_or_create_session(url).await?;
        let req = JsonRpcRequest::new("discovery-list", "tools/list", None);

        let resp = self
            .http
            .post(url)
            .header("Accept", "application/json, text/event-stream")
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .header(HEADER_SESSION_ID, &session_id)
            .json(&req)
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| McpClientError::from_reqwest(url, e))?;

        let status = resp.status();
        if status.as_u16() == 404 {
            self.clear_session(url);
            return Err(McpClientError::SessionLost(url.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let body = resp
            .text()
            .await
            .map_err(|e| McpClientError::Parse(format!("reading body from {url}: {e}")))?;

        if content_type.contains("text/event-stream") {
            parse_sse_tools(&body)
                .ok_or_else(|| McpClientError::Parse(format!("no tools/list result in SSE body from {url}")))
        } else {
            let value: Value = serde_json::from_str(&body)
                .map_err(|e| McpClientError::Parse(format!("invalid JSON body from {url}: {e}")))?;
            let result = crate::manager::unwrap_rpc(value)?;
            let parsed: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| McpClientError::Parse(format!("invalid tools/list result from {url}: {e}")))?;
            Ok(parsed.tools)
        }
    }

    /// Lightweight health probe: a `tools/list` with the cached session, if
    /// any. Does NOT create a session — probing must not disturb backends
    /// that simply have no traffic yet.
    pub async fn probe(&self, url: &str) -> Result<(), McpClientError> {
        let session_id = self.cached_session(url);
        let req = JsonRpcRequest::new("health-check", "tools/list", None);

        let mut builder = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .json(&req)
            .timeout(PROBE_TIMEOUT);
        if let Some(sid) = &session_id {
            builder = builder.header(HEADER_SESSION_ID, sid);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| McpClientError::from_reqwest(url, e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 404 && session_id.is_some() {
            tracing::warn!(url, "health probe detected expired session");
            self.clear_session(url);
            return Err(McpClientError::SessionLost(url.to_string()));
        }
        Err(McpClientError::Status {
            status: status.as_u16(),
            body: String::new(),
        })
    }

    /// Best-effort `DELETE` of the backend session, then drop the cache.
    pub async fn close_session(&self, url: &str) {
        let Some(session_id) = self.cached_session(url) else {
            return;
        };
        let result = self
            .http
            .delete(url)
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .header(HEADER_SESSION_ID, &session_id)
            .timeout(CLOSE_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) => tracing::debug!(url, status = %resp.status(), "closed backend session"),
            Err(e) => tracing::debug!(url, error = %e, "failed to close backend session"),
        }
        self.clear_session(url);
    }

    /// Close every cached session.
    pub async fn close_all(&self) {
        let urls: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for url in urls {
            self.close_session(&url).await;
        }
    }
}

/// Scan an SSE body for the first `data:` line carrying a `tools/list`
/// result. Lines that are not valid JSON or lack `result.tools` are skipped.
fn parse_sse_tools(body: &str) -> Option<Vec<ToolDef>> {
    for line in body.lines() {
        let Some(payload) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(payload.trim()) else {
            continue;
        };
        if let Some(result) = value.get("result") {
            if result.get("tools").is_some() {
                if let Ok(parsed) = serde_json::from_value::<ToolsListResult>(result.clone()) {
                    return Some(parsed.tools);
                }
            }
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_tools_extracts_first_result() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":\"discovery-list\",\"result\":{\"tools\":[{\"name\":\"sum\"}]}}\n\n";
        let tools = parse_sse_tools(body).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "sum");
    }

    #[test]
    fn parse_sse_tools_skips_garbage_lines() {
        let body = "data: not-json\n\
                    data: {\"jsonrpc\":\"2.0\",\"result\":{\"ok\":true}}\n\
                    data: {\"result\":{\"tools\":[]}}\n\n";
        let tools = parse_sse_tools(body).unwrap();
        assert!(tools.is_empty());
    }

    #[test]
    fn parse_sse_tools_none_without_result() {
        assert!(parse_sse_tools("data: {\"jsonrpc\":\"2.0\"}\n\n").is_none());
        assert!(parse_sse_tools("").is_none());
    }

    #[tokio::test]
    async fn session_cache_round_trip() {
        let client = HttpPostClient::new(&Default::default()).unwrap();
        assert!(client.cached_session("http://h/mcp").is_none());
        client
            .sessions
            .lock()
            .insert("http://h/mcp".into(), "sess-1".into());
        assert_eq!(client.cached_session("http://h/mcp").unwrap(), "sess-1");
        client.clear_session("http://h/mcp");
        assert!(client.cached_session("http://h/mcp").is_none());
    }

    #[test]
    fn creation_locks_are_per_url() {
        let client = HttpPostClient::new(&Default::default()).unwrap();
        let a1 = client.creation_lock("http://a/mcp");
        let a2 = client.creation_lock("http://a/mcp");
        let b = client.creation_lock("http://b/mcp");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}

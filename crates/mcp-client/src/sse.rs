//! SSE transport for backends whose URL ends in `/sse`.
//!
//! One [`SseClient`] per backend holds one long-lived reader task. The
//! stream is parsed line by line (`event:` / `data:`); the first `endpoint`
//! frame carries the POST URL and session id. Requests register their id in
//! a pending map before the POST and are resolved by the `data:` frame that
//! echoes the same id — the backend may interleave responses for distinct
//! ids in any order. Notifications carry no id and never resolve an awaiter.
//!
//! On stream end or transport error the reader fails all pending awaiters,
//! clears the session, and reconnects after a fixed delay, up to a bounded
//! number of attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use tg_domain::config::BackendsConfig;

use crate::manager::McpClientError;
use crate::protocol::{envelope_id, JsonRpcNotification, JsonRpcRequest};

/// Hard cap on the frame reassembly buffer. A single tool result larger
/// than this is a transport error and forces a reconnect.
const SSE_MAX_BUFFER: usize = 2 * 1024 * 1024;

/// Cap on concurrently awaited requests per backend; beyond this, sends are
/// rejected with a backpressure error.
const MAX_PENDING: usize = 256;

/// How long `connect` waits for the endpoint frame (50 × 100 ms).
const CONNECT_POLLS: u32 = 50;
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const INIT_TIMEOUT: Duration = Duration::from_secs(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SseClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One SSE connection to one backend server.
#[derive(Clone)]
pub struct SseClient {
    inner: Arc<SseInner>,
}

struct SseInner {
    server_url: String,
    http: reqwest::Client,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    state: Mutex<SseState>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct SseState {
    session_id: Option<String>,
    endpoint_url: Option<String>,
    connected: bool,
    initialized: bool,
    should_reconnect: bool,
    reconnect_attempts: u32,
    pending: HashMap<String, oneshot::Sender<Value>>,
    last_activity: Instant,
}

impl SseClient {
    pub fn new(server_url: &str, http: reqwest::Client, cfg: &BackendsConfig) -> Self {
        Self {
            inner: Arc::new(SseInner {
                server_url: server_url.to_string(),
                http,
                reconnect_delay: Duration::from_secs(cfg.sse_reconnect_delay_secs),
                max_reconnect_attempts: cfg.sse_max_reconnect_attempts,
                state: Mutex::new(SseState {
                    session_id: None,
                    endpoint_url: None,
                    connected: false,
                    initialized: false,
                    should_reconnect: true,
                    reconnect_attempts: 0,
                    pending: HashMap::new(),
                    last_activity: Instant::now(),
                }),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.inner.server_url
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn is_initialized(&self) -> bool {
        let st = self.inner.state.lock();
        st.connected && st.initialized
    }

    /// Mark the MCP handshake complete. Only called after a successful
    /// `initialize` + `notifications/initialized` exchange, so a cancelled
    /// initialization can never leave this set.
    pub fn set_initialized(&self) {
        self.inner.state.lock().initialized = true;
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    /// Open the stream and wait for the endpoint frame.
    pub async fn connect(&self) -> Result<(), McpClientError> {
        {
            let mut st = self.inner.state.lock();
            st.should_reconnect = true;
            st.reconnect_attempts = 0;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            reader_loop(inner).await;
        });
        // A previous reader (if any) is replaced; it was already stopped by
        // `close` or gave up after max reconnect attempts.
        if let Some(old) = self.inner.reader.lock().replace(handle) {
            old.abort();
        }

        for _ in 0..CONNECT_POLLS {
            if self.is_connected() {
                tracing::info!(
                    url = %self.inner.server_url,
                    session_id = ?self.session_id(),
                    "SSE backend connected"
                );
                return Ok(());
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }

        tracing::warn!(url = %self.inner.server_url, "timed out waiting for SSE endpoint frame");
        self.close();
        Err(McpClientError::ConnectFailed(self.inner.server_url.clone()))
    }

    /// Send a request and await the SSE frame that echoes its id.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpClientError> {
        let (endpoint, id, rx) = {
            let mut st = self.inner.state.lock();
            if !st.connected {
                return Err(McpClientError::NotConnected(self.inner.server_url.clone()));
            }
            let endpoint = st
                .endpoint_url
                .clone()
                .ok_or_else(|| McpClientError::NotConnected(self.inner.server_url.clone()))?;
            if st.pending.len() >= MAX_PENDING {
                return Err(McpClientError::Backpressure(self.inner.server_url.clone()));
            }
            let id = uuid::Uuid::new_v4().to_string();
            let (tx, rx) = oneshot::channel();
            st.pending.insert(id.clone(), tx);
            (endpoint, id, rx)
        };

        tracing::debug!(
            url = %self.inner.server_url,
            request_id = %id,
            method,
            "sending SSE request"
        );

        let req = JsonRpcRequest::new(id.clone(), method, params);
        let post = self.inner.http.post(&endpoint).json(&req).send().await;
        match post {
            Ok(resp) if resp.status().as_u16() == 200 || resp.status().as_u16() == 202 => {}
            Ok(resp) => {
                self.remove_pending(&id);
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(McpClientError::Status { status, body });
            }
            Err(e) => {
                self.remove_pending(&id);
                return Err(McpClientError::from_reqwest(&self.inner.server_url, e));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Sender dropped: the reader reset the transport underneath us.
            Ok(Err(_)) => Err(McpClientError::TransportReset),
            Err(_) => {
                self.remove_pending(&id);
                tracing::warn!(
                    url = %self.inner.server_url,
                    request_id = %id,
                    timeout_secs = timeout.as_secs(),
                    "timed out waiting for SSE response"
                );
                Err(McpClientError::Timeout(self.inner.server_url.clone()))
            }
        }
    }

    /// Send a notification. No id, nothing awaited.
    pub async fn send_notification(&self, method: &str) -> Result<(), McpClientError> {
        let endpoint = {
            let st = self.inner.state.lock();
            if !st.connected {
                return Err(McpClientError::NotConnected(self.inner.server_url.clone()));
            }
            st.endpoint_url
                .clone()
                .ok_or_else(|| McpClientError::NotConnected(self.inner.server_url.clone()))?
        };

        let notif = JsonRpcNotification::new(method);
        let resp = self
            .inner
            .http
            .post(&endpoint)
            .json(&notif)
            .send()
            .await
            .map_err(|e| McpClientError::from_reqwest(&self.inner.server_url, e))?;
        let status = resp.status().as_u16();
        if status != 200 && status != 202 {
            tracing::warn!(
                url = %self.inner.server_url,
                status,
                method,
                "SSE notification rejected"
            );
        }
        Ok(())
    }

    /// Run the MCP handshake over this connection.
    pub async fn initialize(&self) -> Result<(), McpClientError> {
        let params = serde_json::to_value(crate::protocol::initialize_params())?;
        let response = self
            .send_request("initialize", Some(params), INIT_TIMEOUT)
            .await?;
        crate::manager::unwrap_rpc(response)?;
        self.send_notification("notifications/initialized").await?;
        self.set_initialized();
        tracing::info!(url = %self.inner.server_url, "SSE backend initialized");
        Ok(())
    }

    /// Stop the reader, cancel reconnection, and fail every pending awaiter.
    pub fn close(&self) {
        {
            let mut st = self.inner.state.lock();
            st.should_reconnect = false;
            st.connected = false;
            st.initialized = false;
            st.session_id = None;
            st.endpoint_url = None;
            st.pending.clear();
        }
        if let Some(handle) = self.inner.reader.lock().take() {
            handle.abort();
        }
        tracing::debug!(url = %self.inner.server_url, "SSE client closed");
    }

    fn remove_pending(&self, id: &str) {
        self.inner.state.lock().pending.remove(id);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reader task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn reader_loop(inner: Arc<SseInner>) {
    loop {
        if !inner.state.lock().should_reconnect {
            break;
        }

        let attempt = inner.state.lock().reconnect_attempts + 1;
        tracing::debug!(url = %inner.server_url, attempt, "opening SSE stream");

        match inner
            .http
            .get(&inner.server_url)
            .header("Accept", "text/event-stream")
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                read_stream(&inner, resp).await;
                tracing::debug!(url = %inner.server_url, "SSE stream ended");
            }
            Ok(resp) => {
                tracing::warn!(
                    url = %inner.server_url,
                    status = resp.status().as_u16(),
                    "SSE backend returned error status"
                );
            }
            Err(e) => {
                tracing::warn!(url = %inner.server_url, error = %e, "SSE connection error");
            }
        }

        // Disconnected. Reset session state and fail outstanding awaiters —
        // their responses can never arrive on the next stream.
        let should_retry = {
            let mut st = inner.state.lock();
            let was_connected = st.connected;
            st.connected = false;
            st.initialized = false;
            st.session_id = None;
            st.endpoint_url = None;
            let dropped = st.pending.len();
            st.pending.clear();
            if was_connected {
                tracing::info!(
                    url = %inner.server_url,
                    dropped_requests = dropped,
                    idle_secs = st.last_activity.elapsed().as_secs(),
                    "SSE backend disconnected"
                );
            }
            if st.should_reconnect && st.reconnect_attempts < inner.max_reconnect_attempts {
                st.reconnect_attempts += 1;
                true
            } else {
                if st.reconnect_attempts >= inner.max_reconnect_attempts {
                    tracing::warn!(
                        url = %inner.server_url,
                        attempts = st.reconnect_attempts,
                        "giving up on SSE backend after max reconnect attempts"
                    );
                }
                false
            }
        };

        if !should_retry {
            break;
        }
        tokio::time::sleep(inner.reconnect_delay).await;
    }

    tracing::debug!(url = %inner.server_url, "SSE reader exiting");
}

/// Drain one stream until it ends or errors. Frames are reassembled from
/// chunks in a bounded buffer and parsed line by line.
async fn read_stream(inner: &Arc<SseInner>, mut resp: reqwest::Response) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut current_event: Option<String> = None;

    loop {
        match resp.chunk().await {
            Ok(Some(bytes)) => {
                buffer.extend_from_slice(&bytes);
                if buffer.len() > SSE_MAX_BUFFER {
                    tracing::error!(
                        url = %inner.server_url,
                        buffered = buffer.len(),
                        "SSE frame exceeds buffer cap, resetting connection"
                    );
                    return;
                }
                inner.state.lock().last_activity = Instant::now();

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    handle_line(inner, &mut current_event, line);
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(url = %inner.server_url, error = %e, "SSE read error");
                return;
            }
        }
    }
}

/// Dispatch one SSE line. `event:` lines set the current event type, which
/// persists until the next one; `data:` lines carry payloads.
fn handle_line(inner: &Arc<SseInner>, current_event: &mut Option<String>, line: &str) {
    if let Some(event) = line.strip_prefix("event:") {
        *current_event = Some(event.trim().to_string());
        return;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return;
    };
    let data = data.trim();

    match serde_json::from_str::<Value>(data) {
        Ok(Value::String(s)) if current_event.as_deref() == Some("endpoint") => {
            handle_endpoint(inner, &s);
        }
        Ok(value) => handle_message(inner, value),
        // Unparseable payloads are ignored unless this is the endpoint
        // frame, whose payload is a bare URL rather than JSON.
        Err(_) if current_event.as_deref() == Some("endpoint") => {
            handle_endpoint(inner, data);
        }
        Err(_) => {
            tracing::debug!(url = %inner.server_url, "ignoring unparseable SSE data line");
        }
    }
}

/// Capture the POST endpoint and session id from the `endpoint` frame.
fn handle_endpoint(inner: &Arc<SseInner>, raw: &str) {
    let Some(idx) = raw.find("session_id=") else {
        tracing::warn!(url = %inner.server_url, "endpoint frame without session_id");
        return;
    };
    let session_id = raw[idx + "session_id=".len()..]
        .split('&')
        .next()
        .unwrap_or("")
        .to_string();

    let endpoint_url = if raw.starts_with("http") {
        raw.to_string()
    } else {
        match reqwest::Url::parse(&inner.server_url).and_then(|base| base.join(raw)) {
            Ok(url) => url.to_string(),
            Err(e) => {
                tracing::warn!(url = %inner.server_url, error = %e, "invalid endpoint frame");
                return;
            }
        }
    };

    let mut st = inner.state.lock();
    st.session_id = Some(session_id.clone());
    st.endpoint_url = Some(endpoint_url);
    st.connected = true;
    tracing::info!(
        url = %inner.server_url,
        session_id = %session_id,
        "SSE session established"
    );
}

/// Correlate a JSON frame with a pending awaiter by id, exactly once.
/// Frames with unknown ids are dropped and logged; frames without an id are
/// notifications and never resolve anything.
fn handle_message(inner: &Arc<SseInner>, value: Value) {
    // Some servers deliver the endpoint as a JSON-RPC style envelope.
    if value.get("method").and_then(Value::as_str) == Some("endpoint") {
        if let Some(endpoint) = value
            .pointer("/params/endpoint")
            .and_then(Value::as_str)
        {
            handle_endpoint(inner, endpoint);
        }
        return;
    }

    let Some(id) = envelope_id(&value) else {
        return;
    };

    let sender = inner.state.lock().pending.remove(&id);
    match sender {
        Some(tx) => {
            tracing::debug!(url = %inner.server_url, request_id = %id, "SSE response correlated");
            // Receiver may have timed out already; that's fine.
            let _ = tx.send(value);
        }
        None => {
            tracing::warn!(
                url = %inner.server_url,
                request_id = %id,
                "dropping SSE response for unknown request id"
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SseClient {
        SseClient::new(
            "http://h/sse",
            reqwest::Client::new(),
            &BackendsConfig::default(),
        )
    }

    fn register(client: &SseClient, id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        client
            .inner
            .state
            .lock()
            .pending
            .insert(id.to_string(), tx);
        rx
    }

    #[test]
    fn endpoint_frame_establishes_session() {
        let client = client();
        let mut event = None;
        handle_line(&client.inner, &mut event, "event: endpoint");
        handle_line(
            &client.inner,
            &mut event,
            "data: /messages/?session_id=abc123",
        );

        assert!(client.is_connected());
        assert_eq!(client.session_id().unwrap(), "abc123");
        let endpoint = client.inner.state.lock().endpoint_url.clone().unwrap();
        assert_eq!(endpoint, "http://h/messages/?session_id=abc123");
    }

    #[test]
    fn absolute_endpoint_used_verbatim() {
        let client = client();
        handle_endpoint(&client.inner, "http://other:9/messages?session_id=s9");
        let endpoint = client.inner.state.lock().endpoint_url.clone().unwrap();
        assert_eq!(endpoint, "http://other:9/messages?session_id=s9");
        assert_eq!(client.session_id().unwrap(), "s9");
    }

    #[test]
    fn out_of_order_responses_resolve_correct_awaiters() {
        let client = client();
        let mut rx1 = register(&client, "r1");
        let mut rx2 = register(&client, "r2");

        // r2 was issued first, but the backend answers r1 first.
        handle_message(
            &client.inner,
            serde_json::json!({"jsonrpc": "2.0", "id": "r1", "result": {"n": 1}}),
        );
        handle_message(
            &client.inner,
            serde_json::json!({"jsonrpc": "2.0", "id": "r2", "result": {"n": 2}}),
        );

        let v1 = rx1.try_recv().unwrap();
        let v2 = rx2.try_recv().unwrap();
        assert_eq!(v1.pointer("/result/n").unwrap(), 1);
        assert_eq!(v2.pointer("/result/n").unwrap(), 2);
    }

    #[test]
    fn response_resolves_awaiter_exactly_once() {
        let client = client();
        let mut rx = register(&client, "r1");

        handle_message(
            &client.inner,
            serde_json::json!({"id": "r1", "result": 1}),
        );
        // Duplicate delivery: the pending entry is gone, nothing resolves.
        handle_message(
            &client.inner,
            serde_json::json!({"id": "r1", "result": 2}),
        );

        assert_eq!(rx.try_recv().unwrap().get("result").unwrap(), 1);
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn unknown_id_is_dropped() {
        let client = client();
        let mut rx = register(&client, "r1");
        handle_message(
            &client.inner,
            serde_json::json!({"id": "stranger", "result": 1}),
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(client.pending_len(), 1);
    }

    #[test]
    fn notification_never_resolves_awaiters() {
        let client = client();
        let mut rx = register(&client, "r1");
        handle_message(
            &client.inner,
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(client.pending_len(), 1);
    }

    #[test]
    fn numeric_ids_correlate() {
        let client = client();
        let mut rx = register(&client, "7");
        handle_message(&client.inner, serde_json::json!({"id": 7, "result": "ok"}));
        assert_eq!(rx.try_recv().unwrap().get("result").unwrap(), "ok");
    }

    #[test]
    fn unparseable_data_ignored_outside_endpoint_event() {
        let client = client();
        let mut event = Some("message".to_string());
        handle_line(&client.inner, &mut event, "data: this is not json");
        assert!(!client.is_connected());
    }

    #[test]
    fn event_type_persists_across_data_lines() {
        let client = client();
        let mut event = None;
        handle_line(&client.inner, &mut event, "event: endpoint");
        // Interleaved unrelated line keeps the event type.
        handle_line(&client.inner, &mut event, ": comment");
        handle_line(&client.inner, &mut event, "data: /sse/messages?session_id=zz");
        assert!(client.is_connected());
    }

    #[test]
    fn close_fails_pending_awaiters() {
        let client = client();
        let mut rx = register(&client, "r1");
        client.close();
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn json_string_endpoint_payload_handled() {
        let client = client();
        let mut event = Some("endpoint".to_string());
        handle_line(
            &client.inner,
            &mut event,
            "data: \"/messages/?session_id=q1\"",
        );
        assert_eq!(client.session_id().unwrap(), "q1");
    }
}

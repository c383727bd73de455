//! Discovery service: the periodic fan-out that enumerates tools across
//! healthy backends and rebuilds the `tool_name → backend URL` index.
//!
//! One refresh mutex serializes rebuilds. The registered server set from
//! the store is authoritative; backends the circuit breaker skips simply
//! drop out of the index until they recover. On duplicate tool names the
//! last fan-out writer wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};

use tg_mcp_client::manager::is_sse_url;
use tg_mcp_client::{ToolBackend, ToolDef};
use tg_store::GatewayStore;

use crate::runtime::health::HealthMonitor;

/// Errors from tool resolution.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("tool not available on any registered server: {0}")]
    ToolNotFound(String),
}

/// Discovers and indexes tools from all registered backends.
pub struct DiscoveryService {
    store: Arc<GatewayStore>,
    backend: Arc<dyn ToolBackend>,
    health: Arc<HealthMonitor>,
    /// `tool_name → server URL`, replaced atomically per refresh.
    index: RwLock<HashMap<String, String>>,
    /// `server URL → tool definitions`, the cached metadata the local
    /// `tools/list` is served from.
    tools_cache: RwLock<HashMap<String, Vec<ToolDef>>>,
    /// Serializes index rebuilds.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl DiscoveryService {
    pub fn new(
        store: Arc<GatewayStore>,
        backend: Arc<dyn ToolBackend>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            store,
            backend,
            health,
            index: RwLock::new(HashMap::new()),
            tools_cache: RwLock::new(HashMap::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    fn registered_urls(&self) -> Vec<String> {
        self.store
            .list_servers()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| s.url)
            .collect()
    }

    /// Rebuild the tool index: load the server set from the store, skip
    /// circuit-broken backends, fan out concurrently with adaptive
    /// timeouts, and atomically replace the index with the union.
    pub async fn refresh(&self) {
        let _guard = self.refresh_lock.lock().await;
        tracing::info!("refreshing tool index");

        let urls = self.registered_urls();
        if urls.is_empty() {
            tracing::info!("no backends registered, tool index cleared");
            *self.index.write() = HashMap::new();
            *self.tools_cache.write() = HashMap::new();
            return;
        }

        let (healthy, skipped): (Vec<_>, Vec<_>) =
            urls.into_iter().partition(|url| !self.health.should_skip(url));
        if !skipped.is_empty() {
            tracing::info!(skipped = ?skipped, "circuit breaker skipping backends during discovery");
        }
        if healthy.is_empty() {
            tracing::warn!("all backends unhealthy, keeping previous tool index until recovery");
            return;
        }

        let fetches = healthy.iter().map(|url| self.fetch_with_timeout(url));
        let results = futures_util::future::join_all(fetches).await;

        let mut new_index: HashMap<String, String> = HashMap::new();
        let mut new_cache: HashMap<String, Vec<ToolDef>> = HashMap::new();
        for (url, tools) in results {
            let Some(tools) = tools else { continue };
            for tool in &tools {
                // Last writer wins on duplicate names.
                new_index.insert(tool.name.clone(), url.clone());
            }
            new_cache.insert(url, tools);
        }

        let unique_tools = new_index.len();
        *self.index.write() = new_index;
        *self.tools_cache.write() = new_cache;
        tracing::info!(
            tools = unique_tools,
            healthy = healthy.len(),
            skipped = skipped.len(),
            "tool index refreshed"
        );
    }

    /// Fetch one backend's tools under the adaptive timeout. Failures and
    /// timeouts mark the backend's health; SSE backends are disconnected so
    /// a half-open stream is not left behind.
    async fn fetch_with_timeout(&self, url: &str) -> (String, Option<Vec<ToolDef>>) {
        self.health.ensure_entry(url);
        let timeout = self.health.adaptive_timeout(url);

        match tokio::time::timeout(timeout, self.backend.list_tools(url)).await {
            Ok(Ok(tools)) => {
                tracing::debug!(url, count = tools.len(), "fetched tool list");
                self.health.mark_success(url);
                (url.to_string(), Some(tools))
            }
            Ok(Err(e)) => {
                tracing::warn!(url, error = %e, "tool list fetch failed");
                self.health.mark_failure(url, &e.to_string());
                if is_sse_url(url) {
                    self.backend.disconnect(url).await;
                }
                (url.to_string(), None)
            }
            Err(_) => {
                tracing::warn!(url, timeout_secs = timeout.as_secs(), "tool list fetch timed out");
                self.health
                    .mark_failure(url, &format!("timeout ({}s)", timeout.as_secs()));
                if is_sse_url(url) {
                    self.backend.disconnect(url).await;
                }
                (url.to_string(), None)
            }
        }
    }

    /// Cached lookup only.
    pub fn tool_location_cached(&self, tool_name: &str) -> Option<String> {
        self.index.read().get(tool_name).cloned()
    }

    /// Find which backend hosts a tool. A miss triggers one refresh (the
    /// tool may have just been registered); a second miss is terminal.
    pub async fn tool_location(&self, tool_name: &str) -> Result<String, DiscoveryError> {
        if let Some(url) = self.tool_location_cached(tool_name) {
            return Ok(url);
        }
        self.refresh().await;
        self.tool_location_cached(tool_name)
            .ok_or_else(|| DiscoveryError::ToolNotFound(tool_name.to_string()))
    }

    /// The cached tool metadata, flattened to `(server_url, tool)` pairs.
    /// This is what the gateway's local `tools/list` serves from.
    pub fn cached_tools(&self) -> Vec<(String, ToolDef)> {
        self.tools_cache
            .read()
            .iter()
            .flat_map(|(url, tools)| tools.iter().map(move |t| (url.clone(), t.clone())))
            .collect()
    }

    /// Aggregate every healthy backend's tools, enriched with gateway
    /// metadata: `_server_url`, `_server_id`, `_discovery_timestamp`,
    /// `_oauth_providers`, and `_access_roles`. The OAuth and role
    /// annotations are computed from the store at call time.
    pub async fn all_tools(&self) -> Vec<Value> {
        if self.index.read().is_empty() {
            self.refresh().await;
        }

        let servers = self.store.list_servers();
        let id_by_url: HashMap<String, String> = servers
            .iter()
            .map(|s| (s.url.clone(), s.server_id.clone()))
            .collect();

        // Annotation tables, keyed by (server_id, tool_name).
        let mut oauth_by_tool: HashMap<(String, String), Vec<Value>> = HashMap::new();
        for assoc in self.store.list_tool_oauth() {
            let provider_name = self
                .store
                .get_oauth_provider(&assoc.provider_id)
                .map(|p| p.provider_name);
            oauth_by_tool
                .entry((assoc.server_id, assoc.tool_name))
                .or_default()
                .push(json!({
                    "provider_id": assoc.provider_id,
                    "provider_name": provider_name,
                }));
        }

        let roles: HashMap<String, tg_store::RoleRecord> = self
            .store
            .list_roles()
            .into_iter()
            .map(|r| (r.role_id.clone(), r))
            .collect();
        let mut roles_by_tool: HashMap<(String, String), Vec<Value>> = HashMap::new();
        for grant in self.store.all_grants() {
            let Some(role) = roles.get(&grant.role_id) else {
                continue;
            };
            roles_by_tool
                .entry((grant.server_id, grant.tool_name))
                .or_default()
                .push(json!({
                    "role_id": role.role_id,
                    "role_name": role.role_name,
                    "description": role.description,
                }));
        }

        let urls: Vec<String> = servers
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| s.url)
            .collect();
        let (healthy, skipped): (Vec<_>, Vec<_>) =
            urls.into_iter().partition(|url| !self.health.should_skip(url));
        if !skipped.is_empty() {
            tracing::info!(skipped = ?skipped, "skipping unhealthy backends in tool aggregation");
        }

        let fetches = healthy.iter().map(|url| self.fetch_with_timeout(url));
        let results = futures_util::future::join_all(fetches).await;

        let timestamp = Utc::now().to_rfc3339();
        let mut all_tools = Vec::new();
        for (url, tools) in results {
            let Some(tools) = tools else { continue };
            let server_id = id_by_url.get(&url);
            for tool in tools {
                let mut entry = match serde_json::to_value(&tool) {
                    Ok(Value::Object(map)) => map,
                    _ => continue,
                };
                entry.insert("_server_url".into(), json!(url));
                entry.insert("_discovery_timestamp".into(), json!(timestamp));
                if let Some(server_id) = server_id {
                    let key = (server_id.clone(), tool.name.clone());
                    entry.insert("_server_id".into(), json!(server_id));
                    entry.insert(
                        "_oauth_providers".into(),
                        json!(oauth_by_tool.get(&key).cloned().unwrap_or_default()),
                    );
                    entry.insert(
                        "_access_roles".into(),
                        json!(roles_by_tool.get(&key).cloned().unwrap_or_default()),
                    );
                }
                all_tools.push(Value::Object(entry));
            }
        }

        tracing::info!(
            tools = all_tools.len(),
            healthy = healthy.len(),
            skipped = skipped.len(),
            "aggregated tools from healthy backends"
        );
        all_tools
    }

    /// Registered-server and tool-distribution statistics.
    pub fn statistics(&self) -> Value {
        let servers = self.store.list_servers();
        let index = self.index.read();
        let active: HashSet<&String> = index.values().collect();
        let mut distribution: HashMap<String, usize> = HashMap::new();
        for url in index.values() {
            *distribution.entry(url.clone()).or_default() += 1;
        }
        json!({
            "total_servers": servers.len(),
            "active_servers": active.len(),
            "total_tools": index.len(),
            "tool_distribution": distribution,
        })
    }

    /// One health-check pass over every registered backend. SSE backends
    /// that lost their connection are recovered (reconnect + handshake);
    /// HTTP backends are probed once their last success goes stale. A
    /// recovered backend triggers a discovery refresh.
    pub async fn health_pass(&self) {
        let urls = self.registered_urls();
        let valid: HashSet<String> = urls.iter().cloned().collect();
        self.health.prune_missing(&valid);

        for url in urls {
            self.health.ensure_entry(&url);

            if is_sse_url(&url) {
                if self.backend.is_initialized(&url) {
                    self.health.mark_success(&url);
                    continue;
                }
                tracing::warn!(url, "SSE backend not initialized, attempting recovery");
                match self.backend.probe(&url).await {
                    Ok(()) => {
                        tracing::info!(url, "SSE backend recovered");
                        self.health.mark_success(&url);
                        self.refresh().await;
                    }
                    Err(e) => {
                        self.health
                            .mark_failure(&url, &format!("SSE recovery failed: {e}"));
                    }
                }
            } else if self.health.is_stale(&url) {
                tracing::debug!(url, "HTTP backend stale, probing");
                match self.backend.probe(&url).await {
                    Ok(()) => {
                        self.health.mark_success(&url);
                        self.refresh().await;
                    }
                    Err(e) => {
                        self.health.mark_failure(&url, &e.to_string());
                    }
                }
            }
        }
    }
}

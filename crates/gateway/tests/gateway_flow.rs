//! End-to-end routing tests over an injected mock backend: authorization,
//! error taxonomy, circuit breaking, and the local `tools/list` surface.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use tg_auth::{LoginService, OAuthRegistry, TokenIssuer};
use tg_domain::config::Config;
use tg_gateway::api::mcp::{handle_rpc, RpcReply};
use tg_gateway::api::principal::Principal;
use tg_gateway::runtime::discovery::DiscoveryService;
use tg_gateway::runtime::health::HealthMonitor;
use tg_gateway::state::AppState;
use tg_mcp_client::protocol::JsonRpcError;
use tg_mcp_client::{McpClientError, ToolBackend, ToolDef};
use tg_rbac::{Permission, PermissionCache, RbacEngine};
use tg_store::{BackendServer, ToolGrant, UserRecord};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum MockCall {
    Ok(Value),
    Upstream(JsonRpcError),
    Timeout,
}

#[derive(Default)]
struct MockBackend {
    /// Tools each URL advertises.
    tools: Mutex<HashMap<String, Vec<ToolDef>>>,
    /// URLs whose list/probe calls fail.
    failing: Mutex<HashSet<String>>,
    /// Scripted `tools/call` outcomes keyed by tool name.
    call_outcomes: Mutex<HashMap<String, MockCall>>,
    /// Observability for assertions.
    list_calls: Mutex<HashMap<String, u32>>,
    tool_calls: Mutex<Vec<(String, String, Value)>>,
    disconnects: Mutex<Vec<String>>,
}

impl MockBackend {
    fn serve_tool(&self, url: &str, name: &str) {
        self.tools
            .lock()
            .entry(url.to_string())
            .or_default()
            .push(ToolDef {
                name: name.to_string(),
                description: format!("{name} tool"),
                input_schema: json!({ "type": "object", "properties": {} }),
            });
    }

    fn set_failing(&self, url: &str, failing: bool) {
        if failing {
            self.failing.lock().insert(url.to_string());
        } else {
            self.failing.lock().remove(url);
        }
    }

    fn script_call(&self, tool: &str, outcome: MockCall) {
        self.call_outcomes.lock().insert(tool.to_string(), outcome);
    }

    fn list_count(&self, url: &str) -> u32 {
        self.list_calls.lock().get(url).copied().unwrap_or(0)
    }

    fn recorded_calls(&self) -> Vec<(String, String, Value)> {
        self.tool_calls.lock().clone()
    }
}

#[async_trait]
impl ToolBackend for MockBackend {
    async fn list_tools(&self, url: &str) -> Result<Vec<ToolDef>, McpClientError> {
        *self.list_calls.lock().entry(url.to_string()).or_default() += 1;
        if self.failing.lock().contains(url) {
            return Err(McpClientError::ConnectFailed(url.to_string()));
        }
        Ok(self.tools.lock().get(url).cloned().unwrap_or_default())
    }

    async fn call_tool(
        &self,
        url: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpClientError> {
        self.tool_calls
            .lock()
            .push((url.to_string(), tool_name.to_string(), arguments));
        match self.call_outcomes.lock().get(tool_name) {
            None => Ok(json!({ "ok": true })),
            Some(MockCall::Ok(value)) => Ok(value.clone()),
            Some(MockCall::Upstream(err)) => Err(McpClientError::Upstream(err.clone())),
            Some(MockCall::Timeout) => Err(McpClientError::Timeout(url.to_string())),
        }
    }

    async fn probe(&self, url: &str) -> Result<(), McpClientError> {
        if self.failing.lock().contains(url) {
            return Err(McpClientError::ConnectFailed(url.to_string()));
        }
        Ok(())
    }

    fn is_initialized(&self, _url: &str) -> bool {
        true
    }

    async fn disconnect(&self, url: &str) {
        self.disconnects.lock().push(url.to_string());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TestGateway {
    _dir: tempfile::TempDir,
    state: AppState,
    mock: Arc<MockBackend>,
}

fn gateway() -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(Config::default());
    let store = Arc::new(tg_store::GatewayStore::open(dir.path()).unwrap());
    let rbac = Arc::new(RbacEngine::new(
        store.clone(),
        PermissionCache::new(Duration::from_secs(300), 1000),
    ));
    rbac.ensure_defaults().unwrap();
    let tokens = Arc::new(TokenIssuer::new(b"test-secret".to_vec(), 3600));
    let oauth = Arc::new(OAuthRegistry::new(store.clone()));
    let login = Arc::new(LoginService::new(
        store.clone(),
        rbac.clone(),
        tokens.clone(),
        oauth,
        &config.auth,
    ));
    let mock = Arc::new(MockBackend::default());
    let backend: Arc<dyn ToolBackend> = mock.clone();
    let health = Arc::new(HealthMonitor::new(&config.health));
    let discovery = Arc::new(DiscoveryService::new(
        store.clone(),
        backend.clone(),
        health.clone(),
    ));

    TestGateway {
        _dir: dir,
        state: AppState {
            config,
            store,
            rbac,
            tokens,
            login,
            backend,
            health,
            discovery,
        },
        mock,
    }
}

impl TestGateway {
    fn register_server(&self, server_id: &str, url: &str) {
        self.state.store.save_server(BackendServer {
            server_id: server_id.into(),
            url: url.into(),
            enabled: true,
            created_at: chrono::Utc::now(),
        });
    }

    /// A user holding `tool:execute` through an `ops_<name>` role, plus the
    /// given grants.
    fn operator(&self, email: &str, grants: &[(&str, &str)]) -> Principal {
        let role_name = format!("ops {}", email.split('@').next().unwrap_or(email));
        let role = self
            .state
            .rbac
            .create_role(
                &role_name,
                "",
                BTreeSet::from([Permission::ToolExecute, Permission::ToolView]),
            )
            .unwrap();
        let user = self
            .state
            .rbac
            .create_local_user(email, "pw", None, BTreeSet::from([role.role_id.clone()]))
            .unwrap();
        for (server_id, tool) in grants {
            self.state.rbac.add_tool_grant(ToolGrant {
                role_id: role.role_id.clone(),
                server_id: server_id.to_string(),
                tool_name: tool.to_string(),
            });
        }
        principal_of(&user)
    }

    fn admin(&self) -> Principal {
        let user = self.state.store.get_user_by_email("admin").unwrap();
        principal_of(&user)
    }
}

fn principal_of(user: &UserRecord) -> Principal {
    Principal {
        user_id: user.user_id.clone(),
        email: user.email.clone(),
        name: user.name.clone(),
        provider: user.provider.clone(),
        roles: user.roles.clone(),
    }
}

fn reply_body(reply: RpcReply) -> Value {
    match reply {
        RpcReply::Message(body) => body,
        other => panic!("expected a JSON-RPC message, got {other:?}"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// tools/call routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_tool_call_echoes_id() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.mock.serve_tool("http://h/mcp", "sum");
    gw.mock
        .script_call("sum", MockCall::Ok(json!({ "value": 3 })));
    let alice = gw.operator("alice@example.com", &[("b1", "sum")]);
    gw.state.discovery.refresh().await;

    let reply = handle_rpc(
        &gw.state,
        &alice,
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": { "name": "sum", "arguments": { "a": 1, "b": 2 } },
        }),
    )
    .await;

    let body = reply_body(reply);
    assert_eq!(body["id"], 7);
    assert_eq!(body["result"]["value"], 3);
    assert!(body.get("error").is_none());

    let calls = gw.mock.recorded_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "http://h/mcp");
    assert_eq!(calls[0].1, "sum");
    assert_eq!(calls[0].2, json!({ "a": 1, "b": 2 }));
}

#[tokio::test]
async fn deny_by_default_never_contacts_backend() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.mock.serve_tool("http://h/mcp", "sum");
    // Bob's role has a grant on a DIFFERENT server only.
    let bob = gw.operator("bob@example.com", &[("b2", "sum")]);
    gw.state.discovery.refresh().await;

    let reply = handle_rpc(
        &gw.state,
        &bob,
        json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "tools/call",
            "params": { "name": "sum", "arguments": {} },
        }),
    )
    .await;

    let body = reply_body(reply);
    assert_eq!(body["id"], 9);
    assert_eq!(body["error"]["code"], -32001);
    assert_eq!(body["error"]["message"], "Access denied");
    assert!(gw.mock.recorded_calls().is_empty());
}

#[tokio::test]
async fn unknown_tool_is_method_not_found() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.mock.serve_tool("http://h/mcp", "sum");
    let alice = gw.operator("alice@example.com", &[("b1", "sum")]);
    gw.state.discovery.refresh().await;

    let reply = handle_rpc(
        &gw.state,
        &alice,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "missing", "arguments": {} },
        }),
    )
    .await;

    let body = reply_body(reply);
    assert_eq!(body["error"]["code"], -32601);
    assert!(gw.mock.recorded_calls().is_empty());
}

#[tokio::test]
async fn upstream_error_relayed_verbatim() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.mock.serve_tool("http://h/mcp", "sum");
    gw.mock.script_call(
        "sum",
        MockCall::Upstream(JsonRpcError {
            code: -32050,
            message: "tool exploded".into(),
            data: Some(json!({ "detail": "stack" })),
        }),
    );
    let alice = gw.operator("alice@example.com", &[("b1", "sum")]);
    gw.state.discovery.refresh().await;

    let body = reply_body(
        handle_rpc(
            &gw.state,
            &alice,
            json!({
                "jsonrpc": "2.0",
                "id": "req-5",
                "method": "tools/call",
                "params": { "name": "sum", "arguments": {} },
            }),
        )
        .await,
    );

    assert_eq!(body["id"], "req-5");
    assert_eq!(body["error"]["code"], -32050);
    assert_eq!(body["error"]["message"], "tool exploded");
    assert_eq!(body["error"]["data"]["detail"], "stack");
}

#[tokio::test]
async fn timeout_maps_to_connection_error_and_marks_health() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.mock.serve_tool("http://h/mcp", "sum");
    gw.mock.script_call("sum", MockCall::Timeout);
    let alice = gw.operator("alice@example.com", &[("b1", "sum")]);
    gw.state.discovery.refresh().await;

    let body = reply_body(
        handle_rpc(
            &gw.state,
            &alice,
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "sum", "arguments": {} },
            }),
        )
        .await,
    );

    assert_eq!(body["error"]["code"], -32001);
    let health = gw.state.health.snapshot("http://h/mcp").unwrap();
    assert_eq!(health.consecutive_failures, 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local methods
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn initialize_answers_locally_with_session_header() {
    let gw = gateway();
    let admin = gw.admin();
    let reply = handle_rpc(
        &gw.state,
        &admin,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
    )
    .await;

    match reply {
        RpcReply::MessageWithSession(body, session_id) => {
            assert_eq!(body["id"], 1);
            assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
            assert!(!session_id.is_empty());
        }
        other => panic!("expected session reply, got {other:?}"),
    }
}

#[tokio::test]
async fn notifications_are_absorbed() {
    let gw = gateway();
    let admin = gw.admin();
    let reply = handle_rpc(
        &gw.state,
        &admin,
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
    )
    .await;
    assert!(matches!(reply, RpcReply::Accepted));
}

#[tokio::test]
async fn unknown_method_rejected() {
    let gw = gateway();
    let admin = gw.admin();
    let body = reply_body(
        handle_rpc(
            &gw.state,
            &admin,
            json!({ "jsonrpc": "2.0", "id": 4, "method": "resources/list" }),
        )
        .await,
    );
    assert_eq!(body["error"]["code"], -32601);

    let body = reply_body(
        handle_rpc(&gw.state, &admin, json!({ "jsonrpc": "2.0", "id": 5 })).await,
    );
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn tools_list_is_filtered_by_grants() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.mock.serve_tool("http://h/mcp", "sum");
    gw.mock.serve_tool("http://h/mcp", "mul");
    let alice = gw.operator("alice@example.com", &[("b1", "sum")]);
    gw.state.discovery.refresh().await;

    let body = reply_body(
        handle_rpc(
            &gw.state,
            &alice,
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
        )
        .await,
    );
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["sum"]);

    // Admin sees everything.
    let admin = gw.admin();
    let body = reply_body(
        handle_rpc(
            &gw.state,
            &admin,
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        )
        .await,
    );
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["mul", "sum"]);
}

#[tokio::test]
async fn tools_list_is_stable_without_backend_changes() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.mock.serve_tool("http://h/mcp", "sum");
    gw.mock.serve_tool("http://h/mcp", "mul");
    let admin = gw.admin();
    gw.state.discovery.refresh().await;

    let envelope = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
    let first = reply_body(handle_rpc(&gw.state, &admin, envelope.clone()).await);
    let second = reply_body(handle_rpc(&gw.state, &admin, envelope).await);
    assert_eq!(first["result"]["tools"], second["result"]["tools"]);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Circuit breaker & discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn unhealthy_backend_is_not_contacted_by_discovery() {
    let gw = gateway();
    gw.register_server("b1", "http://one/mcp");
    gw.register_server("b3", "http://three/mcp");
    gw.mock.serve_tool("http://one/mcp", "alpha");
    gw.mock.serve_tool("http://three/mcp", "omega");

    // Drive b3 over the failure threshold.
    for _ in 0..3 {
        gw.state.health.mark_failure("http://three/mcp", "connection refused");
    }

    gw.state.discovery.refresh().await;
    assert_eq!(gw.mock.list_count("http://three/mcp"), 0);
    assert_eq!(gw.mock.list_count("http://one/mcp"), 1);

    // The aggregate omits b3 entirely.
    let tools = gw.state.discovery.all_tools().await;
    assert!(!tools.is_empty());
    for tool in &tools {
        assert_eq!(tool["_server_url"], "http://one/mcp");
        assert_eq!(tool["_server_id"], "b1");
    }
    assert!(gw.state.discovery.tool_location_cached("omega").is_none());
    assert!(gw.state.discovery.tool_location_cached("alpha").is_some());
}

#[tokio::test]
async fn recent_failure_skips_backend_within_window() {
    let gw = gateway();
    gw.register_server("b3", "http://three/mcp");
    gw.mock.set_failing("http://three/mcp", true);

    gw.state.discovery.refresh().await;
    assert_eq!(gw.mock.list_count("http://three/mcp"), 1);

    // Still healthy (one failure), but inside the 30s retry window.
    let health = gw.state.health.snapshot("http://three/mcp").unwrap();
    assert!(health.is_healthy);
    gw.state.discovery.refresh().await;
    assert_eq!(gw.mock.list_count("http://three/mcp"), 1);
}

#[tokio::test]
async fn degraded_backend_gets_short_timeout() {
    let gw = gateway();
    gw.register_server("b3", "http://three/mcp");
    gw.state.health.mark_failure("http://three/mcp", "boom");
    assert_eq!(
        gw.state.health.adaptive_timeout("http://three/mcp"),
        Duration::from_secs(5)
    );
}

#[tokio::test]
async fn health_pass_probes_and_recovers_stale_backend() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.mock.serve_tool("http://h/mcp", "sum");

    // Never succeeded: stale, so the pass probes and then refreshes.
    gw.state.discovery.health_pass().await;

    let health = gw.state.health.snapshot("http://h/mcp").unwrap();
    assert!(health.is_healthy);
    assert!(health.last_success.is_some());
    assert!(gw.state.discovery.tool_location_cached("sum").is_some());
}

#[tokio::test]
async fn health_pass_prunes_removed_backends() {
    let gw = gateway();
    gw.register_server("b1", "http://h/mcp");
    gw.state.health.mark_failure("http://gone/mcp", "boom");

    gw.state.discovery.health_pass().await;
    assert!(gw.state.health.snapshot("http://gone/mcp").is_none());
    assert!(gw.state.health.snapshot("http://h/mcp").is_some());
}

#[tokio::test]
async fn duplicate_tool_names_resolve_to_one_backend() {
    let gw = gateway();
    gw.register_server("b1", "http://one/mcp");
    gw.register_server("b2", "http://two/mcp");
    gw.mock.serve_tool("http://one/mcp", "shared");
    gw.mock.serve_tool("http://two/mcp", "shared");
    gw.state.discovery.refresh().await;

    // Last writer wins; either owner is acceptable, but exactly one is.
    let owner = gw.state.discovery.tool_location_cached("shared").unwrap();
    assert!(owner == "http://one/mcp" || owner == "http://two/mcp");
}

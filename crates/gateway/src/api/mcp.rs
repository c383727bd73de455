//! The unified MCP endpoint: one JSON-RPC surface over every backend.
//!
//! `initialize`, `notifications/*`, and `tools/list` are answered locally
//! from discovery and authorization state; only `tools/call` fans out, to
//! the single backend owning the tool. The client's request `id` is
//! preserved in every reply, and upstream JSON-RPC errors are relayed
//! verbatim.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use tg_mcp_client::protocol::{error_codes, HEADER_SESSION_ID, PROTOCOL_VERSION};
use tg_mcp_client::McpClientError;
use tg_rbac::ToolAccess;

use crate::api::principal::Principal;
use crate::state::AppState;

/// What a JSON-RPC exchange produces. Split out from the HTTP layer so the
/// routing logic is testable without a listener.
#[derive(Debug)]
pub enum RpcReply {
    /// A JSON-RPC response body.
    Message(Value),
    /// An `initialize` response plus the minted `Mcp-Session-Id` header.
    MessageWithSession(Value, String),
    /// A notification was absorbed; reply 202 with no body.
    Accepted,
}

/// `POST /mcp`
pub async fn mcp_endpoint(
    State(state): State<AppState>,
    principal: Principal,
    Json(envelope): Json<Value>,
) -> Response {
    match handle_rpc(&state, &principal, envelope).await {
        RpcReply::Message(body) => Json(body).into_response(),
        RpcReply::MessageWithSession(body, session_id) => {
            ([(HEADER_SESSION_ID, session_id)], Json(body)).into_response()
        }
        RpcReply::Accepted => StatusCode::ACCEPTED.into_response(),
    }
}

/// Dispatch one JSON-RPC envelope from an authenticated client.
pub async fn handle_rpc(state: &AppState, principal: &Principal, envelope: Value) -> RpcReply {
    let id = envelope.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = envelope.get("method").and_then(Value::as_str) else {
        return RpcReply::Message(rpc_error(
            id,
            error_codes::INVALID_REQUEST,
            "missing method",
        ));
    };

    match method {
        "initialize" => {
            let session_id = uuid::Uuid::new_v4().to_string();
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": {
                    "name": "toolgate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            tracing::debug!(user = %principal.email, session_id = %session_id, "client session initialized");
            RpcReply::MessageWithSession(rpc_result(id, result), session_id)
        }
        "tools/list" => RpcReply::Message(tools_list(state, principal, id)),
        "tools/call" => {
            RpcReply::Message(tools_call(state, principal, id, envelope.get("params")).await)
        }
        m if m.starts_with("notifications/") => RpcReply::Accepted,
        _ => RpcReply::Message(rpc_error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )),
    }
}

/// Serve `tools/list` from the discovery cache, filtered to what the
/// caller may execute on each server.
fn tools_list(state: &AppState, principal: &Principal, id: Value) -> Value {
    let mut access_by_server: HashMap<String, ToolAccess> = HashMap::new();
    let mut tools: Vec<Value> = Vec::new();

    for (url, def) in state.discovery.cached_tools() {
        let Some(server) = state.store.server_by_url(&url) else {
            continue;
        };
        let access = access_by_server
            .entry(server.server_id.clone())
            .or_insert_with(|| {
                state
                    .rbac
                    .allowed_tools(&principal.user_id, &server.server_id)
            });
        let visible = match access {
            ToolAccess::Unrestricted => true,
            ToolAccess::Restricted(allowed) => allowed.contains(&def.name),
        };
        if visible {
            if let Ok(value) = serde_json::to_value(&def) {
                tools.push(value);
            }
        }
    }

    tools.sort_by(|a, b| {
        let name_a = a.get("name").and_then(Value::as_str).unwrap_or("");
        let name_b = b.get("name").and_then(Value::as_str).unwrap_or("");
        name_a.cmp(name_b)
    });

    rpc_result(id, json!({ "tools": tools }))
}

/// `tools/call` params. The tool name is mandatory; arguments stay opaque
/// JSON all the way to the backend.
#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Route a `tools/call`: resolve the owning backend, authorize, forward,
/// and translate failures into the JSON-RPC error taxonomy.
async fn tools_call(
    state: &AppState,
    principal: &Principal,
    id: Value,
    params: Option<&Value>,
) -> Value {
    let params = params.cloned().unwrap_or(Value::Null);
    let params: ToolCallParams = match serde_json::from_value(params) {
        Ok(parsed) => parsed,
        Err(e) => {
            return rpc_error(
                id,
                error_codes::INVALID_PARAMS,
                format!("invalid tools/call params: {e}"),
            );
        }
    };
    let ToolCallParams {
        name: tool_name,
        arguments,
    } = params;
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };

    // Locate the backend owning this tool.
    let url = match state.discovery.tool_location(&tool_name).await {
        Ok(url) => url,
        Err(e) => {
            return rpc_error(id, error_codes::METHOD_NOT_FOUND, e.to_string());
        }
    };

    // Authorize before any backend traffic.
    let Some(server) = state.store.server_by_url(&url) else {
        // The backend vanished from the registry between refresh and now.
        return rpc_error(id, error_codes::CONNECTION_ERROR, "Access denied");
    };
    if !state
        .rbac
        .can_execute_tool(&principal.user_id, &server.server_id, &tool_name)
    {
        tracing::warn!(
            target: "audit",
            event = "tool.call.denied",
            user_id = %principal.user_id,
            email = %principal.email,
            server_id = %server.server_id,
            tool = %tool_name,
        );
        return rpc_error(id, error_codes::CONNECTION_ERROR, "Access denied");
    }

    tracing::info!(
        target: "audit",
        event = "tool.call",
        user_id = %principal.user_id,
        server_id = %server.server_id,
        tool = %tool_name,
    );

    match state.backend.call_tool(&url, &tool_name, arguments).await {
        Ok(result) => {
            state.health.mark_success(&url);
            rpc_result(id, result)
        }
        // The backend's own JSON-RPC error: same id, same error object.
        Err(McpClientError::Upstream(err)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": err,
        }),
        Err(e) => {
            state.health.mark_failure(&url, &e.to_string());
            tracing::warn!(url = %url, tool = %tool_name, error = %e, "tool call failed");
            rpc_error(id, e.jsonrpc_code(), e.to_string())
        }
    }
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

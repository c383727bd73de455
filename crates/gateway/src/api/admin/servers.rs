//! Backend server administration, health introspection, and the aggregated
//! tool surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use tg_rbac::Permission;
use tg_store::BackendServer;

use crate::api::{api_error, principal::Principal};
use crate::state::AppState;

/// `GET /admin/servers`
pub async fn list_servers(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ServerView) {
        return resp;
    }
    Json(json!({ "servers": state.store.list_servers() })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateServerBody {
    #[serde(default)]
    pub server_id: Option<String>,
    pub url: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

fn d_true() -> bool {
    true
}

/// `POST /admin/servers` — register a backend. A refresh is kicked off so
/// its tools appear without waiting for the next health pass.
pub async fn create_server(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<CreateServerBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ServerAdd) {
        return resp;
    }
    if body.url.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "url required");
    }

    let server_id = body.server_id.unwrap_or_else(|| {
        format!("srv_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
    });
    let server = BackendServer {
        server_id: server_id.clone(),
        url: body.url,
        enabled: body.enabled,
        created_at: Utc::now(),
    };
    state.store.save_server(server.clone());
    tracing::info!(
        target: "audit",
        event = "server.registered",
        server_id = %server_id,
        url = %server.url,
        by = %principal.email,
    );

    let discovery = state.discovery.clone();
    tokio::spawn(async move { discovery.refresh().await });

    (StatusCode::CREATED, Json(json!(server))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct UpdateServerBody {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// `PUT /admin/servers/:id`
pub async fn update_server(
    State(state): State<AppState>,
    principal: Principal,
    Path(server_id): Path<String>,
    Json(body): Json<UpdateServerBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ServerEdit) {
        return resp;
    }
    let Some(mut server) = state.store.get_server(&server_id) else {
        return api_error(StatusCode::NOT_FOUND, "server not found");
    };

    let old_url = server.url.clone();
    if let Some(url) = body.url {
        server.url = url;
    }
    if let Some(enabled) = body.enabled {
        server.enabled = enabled;
    }
    state.store.save_server(server.clone());

    // Tear down transport state tied to a replaced or disabled URL.
    if server.url != old_url || !server.enabled {
        let backend = state.backend.clone();
        tokio::spawn(async move { backend.disconnect(&old_url).await });
    }
    let discovery = state.discovery.clone();
    tokio::spawn(async move { discovery.refresh().await });

    Json(json!(server)).into_response()
}

/// `DELETE /admin/servers/:id`
pub async fn delete_server(
    State(state): State<AppState>,
    principal: Principal,
    Path(server_id): Path<String>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ServerDelete) {
        return resp;
    }
    let Some(server) = state.store.get_server(&server_id) else {
        return api_error(StatusCode::NOT_FOUND, "server not found");
    };
    state.store.delete_server(&server_id);
    tracing::info!(
        target: "audit",
        event = "server.deleted",
        server_id = %server_id,
        by = %principal.email,
    );

    let backend = state.backend.clone();
    let discovery = state.discovery.clone();
    tokio::spawn(async move {
        backend.disconnect(&server.url).await;
        discovery.refresh().await;
    });

    Json(json!({ "deleted": server_id })).into_response()
}

/// `GET /admin/servers/health` — health snapshots for every backend.
pub async fn health_status(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ServerView) {
        return resp;
    }
    Json(json!({ "servers": state.health.snapshot_all() })).into_response()
}

/// `GET /admin/servers/stats`
pub async fn statistics(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ServerView) {
        return resp;
    }
    Json(state.discovery.statistics()).into_response()
}

/// `GET /admin/tools` — aggregated tool list with gateway annotations.
pub async fn all_tools(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ToolView) {
        return resp;
    }
    let tools = state.discovery.all_tools().await;
    Json(json!({ "tools": tools })).into_response()
}

/// `POST /admin/discovery/refresh`
pub async fn refresh_discovery(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ServerTest) {
        return resp;
    }
    state.discovery.refresh().await;
    Json(state.discovery.statistics()).into_response()
}

/// `GET /admin/cache/stats` — permission cache observability.
pub async fn cache_stats(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::ConfigView) {
        return resp;
    }
    Json(json!(state.rbac.cache_stats())).into_response()
}

pub mod admin;
pub mod auth;
pub mod mcp;
pub mod principal;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::state::AppState;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Build the full API router.
///
/// The auth surface and the health probe are public; the MCP endpoint and
/// every admin route authenticate per-request via the [`principal::Principal`]
/// extractor (bearer header or `token` query parameter) and authorize
/// against the RBAC engine.
pub fn router() -> Router<AppState> {
    Router::new()
        // Health probe (public, no auth)
        .route("/health", get(health_probe))
        // ── Auth surface ─────────────────────────────────────────────
        .route("/auth/login/local", post(auth::local_login))
        .route("/auth/login", post(auth::oauth_login))
        .route("/auth/callback", get(auth::oauth_callback))
        .route("/auth/providers", get(auth::list_providers))
        .route("/auth/user", get(auth::current_user))
        .route("/auth/logout", post(auth::logout))
        // ── Unified MCP endpoint ─────────────────────────────────────
        .route("/mcp", post(mcp::mcp_endpoint))
        // ── Admin: users ─────────────────────────────────────────────
        .route("/admin/users", get(admin::users::list_users))
        .route("/admin/users", post(admin::users::create_user))
        .route("/admin/users/:id", delete(admin::users::delete_user))
        .route("/admin/users/:id/enabled", put(admin::users::set_enabled))
        .route("/admin/users/:id/password", put(admin::users::set_password))
        .route(
            "/admin/users/:id/roles/:role_id",
            post(admin::users::assign_role),
        )
        .route(
            "/admin/users/:id/roles/:role_id",
            delete(admin::users::revoke_role),
        )
        // ── Admin: roles & grants ────────────────────────────────────
        .route("/admin/roles", get(admin::roles::list_roles))
        .route("/admin/roles", post(admin::roles::create_role))
        .route("/admin/roles/:id", put(admin::roles::update_role))
        .route("/admin/roles/:id", delete(admin::roles::delete_role))
        .route("/admin/roles/:id/grants", get(admin::roles::list_grants))
        .route("/admin/roles/:id/grants", put(admin::roles::set_grants))
        .route("/admin/roles/:id/grants", post(admin::roles::add_grant))
        .route(
            "/admin/roles/:id/grants/:server_id/:tool_name",
            delete(admin::roles::remove_grant),
        )
        // ── Admin: backend servers & discovery ───────────────────────
        .route("/admin/servers", get(admin::servers::list_servers))
        .route("/admin/servers", post(admin::servers::create_server))
        .route("/admin/servers/:id", put(admin::servers::update_server))
        .route("/admin/servers/:id", delete(admin::servers::delete_server))
        .route("/admin/servers/health", get(admin::servers::health_status))
        .route("/admin/servers/stats", get(admin::servers::statistics))
        .route("/admin/tools", get(admin::servers::all_tools))
        .route(
            "/admin/discovery/refresh",
            post(admin::servers::refresh_discovery),
        )
        .route("/admin/cache/stats", get(admin::servers::cache_stats))
        // ── Admin: OAuth providers & mappings ────────────────────────
        .route("/admin/oauth/providers", get(admin::oauth::list_providers))
        .route("/admin/oauth/providers", post(admin::oauth::save_provider))
        .route(
            "/admin/oauth/providers/:id",
            get(admin::oauth::provider_details),
        )
        .route(
            "/admin/oauth/providers/:id",
            delete(admin::oauth::delete_provider),
        )
        .route("/admin/oauth/mappings", get(admin::oauth::list_mappings))
        .route("/admin/oauth/mappings", post(admin::oauth::add_mapping))
        .route("/admin/oauth/mappings", delete(admin::oauth::remove_mapping))
        .route(
            "/admin/oauth/tool-associations",
            get(admin::oauth::list_tool_associations),
        )
        .route(
            "/admin/oauth/tool-associations",
            post(admin::oauth::add_tool_association),
        )
        .route(
            "/admin/oauth/tool-associations",
            delete(admin::oauth::remove_tool_association),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_probe() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

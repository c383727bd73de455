//! OAuth provider, group-mapping, and tool-association administration.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use tg_rbac::Permission;
use tg_store::{GroupMapping, OAuthProviderRecord, ToolOAuthAssociation};

use crate::api::{api_error, principal::Principal};
use crate::state::AppState;

/// `GET /admin/oauth/providers`
pub async fn list_providers(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    let providers: Vec<_> = state
        .store
        .list_oauth_providers()
        .into_iter()
        .map(|p| provider_view(&p))
        .collect();
    Json(json!({ "providers": providers })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ProviderBody {
    pub provider_id: String,
    pub provider_name: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

fn d_true() -> bool {
    true
}

/// `POST /admin/oauth/providers` — create or replace a provider.
pub async fn save_provider(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<ProviderBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    if body.provider_id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "provider_id required");
    }
    state.store.save_oauth_provider(OAuthProviderRecord {
        provider_id: body.provider_id.clone(),
        provider_name: body.provider_name,
        client_id: body.client_id,
        client_secret: body.client_secret,
        authorize_url: body.authorize_url,
        token_url: body.token_url,
        userinfo_url: body.userinfo_url,
        scopes: body.scopes,
        enabled: body.enabled,
    });
    tracing::info!(
        target: "audit",
        event = "oauth.provider.saved",
        provider_id = %body.provider_id,
        by = %principal.email,
    );
    (StatusCode::CREATED, Json(json!({ "provider_id": body.provider_id }))).into_response()
}

/// `GET /admin/oauth/providers/:id` — details with the secret masked.
pub async fn provider_details(
    State(state): State<AppState>,
    principal: Principal,
    Path(provider_id): Path<String>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    match state.store.get_oauth_provider(&provider_id) {
        Some(provider) => Json(provider_view(&provider)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "OAuth provider not found"),
    }
}

/// `DELETE /admin/oauth/providers/:id`
pub async fn delete_provider(
    State(state): State<AppState>,
    principal: Principal,
    Path(provider_id): Path<String>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    if state.store.delete_oauth_provider(&provider_id) {
        Json(json!({ "deleted": provider_id })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, "OAuth provider not found")
    }
}

#[derive(Debug, Deserialize)]
pub struct MappingsQuery {
    #[serde(default)]
    pub provider_id: Option<String>,
}

/// `GET /admin/oauth/mappings`
pub async fn list_mappings(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<MappingsQuery>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    let mappings = state.store.list_group_mappings(query.provider_id.as_deref());
    Json(json!({ "mappings": mappings })).into_response()
}

/// `POST /admin/oauth/mappings`
pub async fn add_mapping(
    State(state): State<AppState>,
    principal: Principal,
    Json(mapping): Json<GroupMapping>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    if state.store.get_role(&mapping.role_id).is_none() {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("unknown role: {}", mapping.role_id),
        );
    }
    let added = state.store.add_group_mapping(mapping);
    (StatusCode::CREATED, Json(json!({ "added": added }))).into_response()
}

/// `DELETE /admin/oauth/mappings`
pub async fn remove_mapping(
    State(state): State<AppState>,
    principal: Principal,
    Json(mapping): Json<GroupMapping>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    if state.store.remove_group_mapping(&mapping) {
        Json(json!({ "removed": true })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, "mapping not found")
    }
}

/// `GET /admin/oauth/tool-associations`
pub async fn list_tool_associations(
    State(state): State<AppState>,
    principal: Principal,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    Json(json!({ "associations": state.store.list_tool_oauth() })).into_response()
}

/// `POST /admin/oauth/tool-associations`
pub async fn add_tool_association(
    State(state): State<AppState>,
    principal: Principal,
    Json(assoc): Json<ToolOAuthAssociation>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    if state.store.get_oauth_provider(&assoc.provider_id).is_none() {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("unknown OAuth provider: {}", assoc.provider_id),
        );
    }
    let added = state.store.add_tool_oauth(assoc);
    (StatusCode::CREATED, Json(json!({ "added": added }))).into_response()
}

/// `DELETE /admin/oauth/tool-associations`
pub async fn remove_tool_association(
    State(state): State<AppState>,
    principal: Principal,
    Json(assoc): Json<ToolOAuthAssociation>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::OAuthManage) {
        return resp;
    }
    if state.store.remove_tool_oauth(&assoc) {
        Json(json!({ "removed": true })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, "association not found")
    }
}

/// Provider view with the client secret masked to its last four characters.
fn provider_view(provider: &OAuthProviderRecord) -> serde_json::Value {
    let masked = if provider.client_secret.len() > 4 {
        format!(
            "{}{}",
            "•".repeat(20),
            &provider.client_secret[provider.client_secret.len() - 4..]
        )
    } else {
        "••••".to_string()
    };
    json!({
        "provider_id": provider.provider_id,
        "provider_name": provider.provider_name,
        "client_id": provider.client_id,
        "client_secret": masked,
        "authorize_url": provider.authorize_url,
        "token_url": provider.token_url,
        "userinfo_url": provider.userinfo_url,
        "scopes": provider.scopes,
        "enabled": provider.enabled,
    })
}

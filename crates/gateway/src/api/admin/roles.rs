//! Role and role-tool-grant administration.

use std::collections::BTreeSet;
use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use tg_rbac::Permission;
use tg_store::ToolGrant;

use crate::api::admin::users::store_error;
use crate::api::{api_error, principal::Principal};
use crate::state::AppState;

/// Parse permission tokens strictly; an unknown token is a 400, never a
/// silently-dropped grant.
fn parse_permissions(raw: &BTreeSet<String>) -> Result<BTreeSet<Permission>, Response> {
    raw.iter()
        .map(|s| {
            Permission::from_str(s)
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
        })
        .collect()
}

/// `GET /admin/roles`
pub async fn list_roles(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::RoleView) {
        return resp;
    }

    let users = state.store.list_users();
    let roles: Vec<_> = state
        .store
        .list_roles()
        .into_iter()
        .map(|r| {
            let user_count = users.iter().filter(|u| u.roles.contains(&r.role_id)).count();
            json!({
                "role_id": r.role_id,
                "role_name": r.role_name,
                "description": r.description,
                "permissions": r.permissions,
                "is_system": r.is_system,
                "user_count": user_count,
            })
        })
        .collect();
    Json(json!({ "roles": roles })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleBody {
    pub role_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

/// `POST /admin/roles`
pub async fn create_role(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<CreateRoleBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::RoleManage) {
        return resp;
    }
    let permissions = match parse_permissions(&body.permissions) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state
        .rbac
        .create_role(&body.role_name, &body.description, permissions)
    {
        Ok(role) => (
            StatusCode::CREATED,
            Json(json!({ "role_id": role.role_id, "role_name": role.role_name })),
        )
            .into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleBody {
    #[serde(default)]
    pub role_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Option<BTreeSet<String>>,
}

/// `PUT /admin/roles/:id`
pub async fn update_role(
    State(state): State<AppState>,
    principal: Principal,
    Path(role_id): Path<String>,
    Json(body): Json<UpdateRoleBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::RoleManage) {
        return resp;
    }
    let permissions = match &body.permissions {
        Some(raw) => match parse_permissions(raw) {
            Ok(p) => Some(p),
            Err(resp) => return resp,
        },
        None => None,
    };
    match state
        .rbac
        .update_role(&role_id, body.role_name, body.description, permissions)
    {
        Ok(role) => Json(json!({
            "role_id": role.role_id,
            "role_name": role.role_name,
            "permissions": role.permissions,
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}

/// `DELETE /admin/roles/:id`
pub async fn delete_role(
    State(state): State<AppState>,
    principal: Principal,
    Path(role_id): Path<String>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::RoleManage) {
        return resp;
    }
    match state.rbac.delete_role(&role_id) {
        Ok(true) => Json(json!({ "deleted": role_id })).into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "role not found"),
        Err(e) => store_error(e),
    }
}

/// `GET /admin/roles/:id/grants`
pub async fn list_grants(
    State(state): State<AppState>,
    principal: Principal,
    Path(role_id): Path<String>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::RoleView) {
        return resp;
    }
    let grants = state.store.grants_for_role(&role_id);
    Json(json!({ "role_id": role_id, "grants": grants })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct GrantBody {
    pub server_id: String,
    pub tool_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SetGrantsBody {
    pub grants: Vec<GrantBody>,
}

/// `PUT /admin/roles/:id/grants` — replace all grants of a role.
pub async fn set_grants(
    State(state): State<AppState>,
    principal: Principal,
    Path(role_id): Path<String>,
    Json(body): Json<SetGrantsBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::RoleManage) {
        return resp;
    }
    if state.store.get_role(&role_id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "role not found");
    }
    let grants: Vec<ToolGrant> = body
        .grants
        .into_iter()
        .map(|g| ToolGrant {
            role_id: role_id.clone(),
            server_id: g.server_id,
            tool_name: g.tool_name,
        })
        .collect();
    let count = grants.len();
    state.rbac.set_role_grants(&role_id, grants);
    Json(json!({ "role_id": role_id, "grants": count })).into_response()
}

/// `POST /admin/roles/:id/grants` — add one grant.
pub async fn add_grant(
    State(state): State<AppState>,
    principal: Principal,
    Path(role_id): Path<String>,
    Json(body): Json<GrantBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::RoleManage) {
        return resp;
    }
    if state.store.get_role(&role_id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "role not found");
    }
    let added = state.rbac.add_tool_grant(ToolGrant {
        role_id: role_id.clone(),
        server_id: body.server_id.clone(),
        tool_name: body.tool_name.clone(),
    });
    Json(json!({ "role_id": role_id, "added": added })).into_response()
}

/// `DELETE /admin/roles/:id/grants/:server_id/:tool_name`
pub async fn remove_grant(
    State(state): State<AppState>,
    principal: Principal,
    Path((role_id, server_id, tool_name)): Path<(String, String, String)>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::RoleManage) {
        return resp;
    }
    let removed = state.rbac.remove_tool_grant(&ToolGrant {
        role_id: role_id.clone(),
        server_id,
        tool_name,
    });
    if removed {
        Json(json!({ "role_id": role_id, "removed": true })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, "grant not found")
    }
}

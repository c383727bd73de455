//! User administration.

use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use tg_rbac::Permission;
use tg_store::StoreError;

use crate::api::{api_error, principal::Principal};
use crate::state::AppState;

/// `GET /admin/users`
pub async fn list_users(State(state): State<AppState>, principal: Principal) -> Response {
    if let Err(resp) = principal.require(&state, Permission::UserView) {
        return resp;
    }

    let roles = state.store.list_roles();
    let role_name = |rid: &str| {
        roles
            .iter()
            .find(|r| r.role_id == rid)
            .map(|r| r.role_name.clone())
    };

    let users: Vec<_> = state
        .store
        .list_users()
        .into_iter()
        .map(|u| {
            let names: Vec<String> = u.roles.iter().filter_map(|r| role_name(r)).collect();
            json!({
                "user_id": u.user_id,
                "email": u.email,
                "name": u.name,
                "provider": u.provider,
                "roles": names,
                "role_ids": u.roles,
                "enabled": u.enabled,
                "created_at": u.created_at,
                "last_login": u.last_login,
            })
        })
        .collect();
    Json(json!({ "users": users })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

/// `POST /admin/users` — create a local user.
pub async fn create_user(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<CreateUserBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::UserManage) {
        return resp;
    }
    if body.email.is_empty() || body.password.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "email and password required");
    }

    match state
        .rbac
        .create_local_user(&body.email, &body.password, body.name, body.roles)
    {
        Ok(user) => (
            StatusCode::CREATED,
            Json(json!({ "user_id": user.user_id, "email": user.email })),
        )
            .into_response(),
        Err(StoreError::EmailTaken(email)) => {
            api_error(StatusCode::CONFLICT, format!("email already registered: {email}"))
        }
        Err(StoreError::RoleNotFound(role)) => {
            api_error(StatusCode::BAD_REQUEST, format!("unknown role: {role}"))
        }
        Err(e) => store_error(e),
    }
}

/// `DELETE /admin/users/:id`
pub async fn delete_user(
    State(state): State<AppState>,
    principal: Principal,
    Path(user_id): Path<String>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::UserManage) {
        return resp;
    }
    if state.rbac.delete_user(&user_id) {
        Json(json!({ "deleted": user_id })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, "user not found")
    }
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledBody {
    pub enabled: bool,
}

/// `PUT /admin/users/:id/enabled`
pub async fn set_enabled(
    State(state): State<AppState>,
    principal: Principal,
    Path(user_id): Path<String>,
    Json(body): Json<SetEnabledBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::UserManage) {
        return resp;
    }
    match state.rbac.set_user_enabled(&user_id, body.enabled) {
        Ok(()) => Json(json!({ "user_id": user_id, "enabled": body.enabled })).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordBody {
    pub password: String,
}

/// `PUT /admin/users/:id/password` — local users only.
pub async fn set_password(
    State(state): State<AppState>,
    principal: Principal,
    Path(user_id): Path<String>,
    Json(body): Json<SetPasswordBody>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::UserManage) {
        return resp;
    }
    if body.password.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "password required");
    }
    match state.rbac.update_password(&user_id, &body.password) {
        Ok(()) => Json(json!({ "user_id": user_id })).into_response(),
        Err(e) => store_error(e),
    }
}

/// `POST /admin/users/:id/roles/:role_id`
pub async fn assign_role(
    State(state): State<AppState>,
    principal: Principal,
    Path((user_id, role_id)): Path<(String, String)>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::UserManage) {
        return resp;
    }
    match state.rbac.assign_role(&user_id, &role_id) {
        Ok(_) => Json(json!({ "user_id": user_id, "role_id": role_id })).into_response(),
        Err(e) => store_error(e),
    }
}

/// `DELETE /admin/users/:id/roles/:role_id`
pub async fn revoke_role(
    State(state): State<AppState>,
    principal: Principal,
    Path((user_id, role_id)): Path<(String, String)>,
) -> Response {
    if let Err(resp) = principal.require(&state, Permission::UserManage) {
        return resp;
    }
    if state.rbac.revoke_role(&user_id, &role_id) {
        Json(json!({ "user_id": user_id, "role_id": role_id })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, "assignment not found")
    }
}

/// Map store errors onto admin-path HTTP statuses. Store unavailability is
/// a 503 — authorization is never downgraded to allow.
pub(crate) fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::UserNotFound(_) | StoreError::RoleNotFound(_) => {
            api_error(StatusCode::NOT_FOUND, e.to_string())
        }
        StoreError::EmailTaken(_) => api_error(StatusCode::CONFLICT, e.to_string()),
        StoreError::SystemRole(_) => api_error(StatusCode::FORBIDDEN, e.to_string()),
        StoreError::Io(_) | StoreError::Json(_) => {
            tracing::error!(error = %e, "store failure");
            api_error(StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

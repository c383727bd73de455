//! Auth endpoints: local login, the OAuth dance, and identity introspection.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Redirect, Response};
use serde::Deserialize;
use serde_json::json;

use tg_auth::login::append_query;
use tg_auth::LoginError;

use crate::api::{api_error, principal::Principal};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /auth/login/local
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct LocalLoginBody {
    pub email: String,
    pub password: String,
}

pub async fn local_login(
    State(state): State<AppState>,
    Json(body): Json<LocalLoginBody>,
) -> Response {
    if body.email.is_empty() || body.password.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "email and password required");
    }

    match state.login.local_login(&body.email, &body.password) {
        Ok(login) => Json(json!({
            "access_token": login.access_token,
            "token_type": "bearer",
            "user": {
                "email": login.user.email,
                "name": login.user.name,
                "roles": login.role_names,
            },
        }))
        .into_response(),
        Err(LoginError::InvalidCredentials) => {
            api_error(StatusCode::UNAUTHORIZED, "invalid credentials")
        }
        Err(e) => {
            tracing::error!(error = %e, "local login failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "login failed")
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /auth/login  (OAuth initiation)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct OAuthLoginQuery {
    pub provider_id: String,
    /// Optional cross-origin target the browser should land on after the
    /// callback, keyed to the minted `state`.
    #[serde(default)]
    pub redirect_to: Option<String>,
}

pub async fn oauth_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OAuthLoginQuery>,
) -> Response {
    let base = external_base_url(&headers, &state);
    let redirect_uri = format!("{base}/auth/callback");

    match state
        .login
        .begin_oauth(&query.provider_id, &redirect_uri, query.redirect_to)
    {
        Ok(auth) => Json(auth).into_response(),
        Err(LoginError::OAuth(e)) => {
            tracing::warn!(provider_id = %query.provider_id, error = %e, "OAuth login rejected");
            api_error(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "OAuth login failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "login failed")
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /auth/callback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    // Error redirects (e.g. the IdP denied consent) loop back to login.
    if let Some(error) = &query.error {
        tracing::warn!(error, message = ?query.message, "OAuth callback carried an error");
        let mut pairs = vec![("error", error.as_str())];
        if let Some(message) = &query.message {
            pairs.push(("message", message.as_str()));
        }
        return Redirect::to(&append_query("/auth/login", &pairs)).into_response();
    }

    let (Some(code), Some(oauth_state)) = (&query.code, &query.state) else {
        tracing::warn!("OAuth callback missing code or state");
        return Redirect::to(&append_query(
            "/auth/login",
            &[
                ("error", "invalid_request"),
                ("message", "Missing authorization code"),
            ],
        ))
        .into_response();
    };

    match state.login.oauth_callback(code, oauth_state).await {
        Ok(outcome) => Redirect::to(&outcome.redirect_url).into_response(),
        Err(LoginError::AccessDenied { redirect_url }) => {
            Redirect::to(&redirect_url).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "OAuth callback failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("authentication failed: {e}"),
            )
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /auth/providers · GET /auth/user · POST /auth/logout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enabled providers, as shown on the login page. Public.
pub async fn list_providers(State(state): State<AppState>) -> Response {
    let providers: Vec<_> = state
        .store
        .list_oauth_providers()
        .into_iter()
        .filter(|p| p.enabled)
        .map(|p| {
            json!({
                "provider_id": p.provider_id,
                "provider_name": p.provider_name,
            })
        })
        .collect();
    Json(json!({ "providers": providers })).into_response()
}

pub async fn current_user(State(state): State<AppState>, principal: Principal) -> Response {
    let role_names: Vec<String> = principal
        .roles
        .iter()
        .filter_map(|rid| state.store.get_role(rid))
        .map(|r| r.role_name)
        .collect();
    let permissions: Vec<&str> = state
        .rbac
        .user_permissions(&principal.user_id)
        .into_iter()
        .map(|p| p.as_str())
        .collect();
    let enabled = state
        .store
        .get_user(&principal.user_id)
        .map(|u| u.enabled)
        .unwrap_or(false);

    Json(json!({
        "user_id": principal.user_id,
        "email": principal.email,
        "name": principal.name,
        "provider": principal.provider,
        "roles": role_names,
        "permissions": permissions,
        "enabled": enabled,
    }))
    .into_response()
}

pub async fn logout(principal: Principal) -> Response {
    // Tokens are stateless; logout is an audit record, not a revocation.
    tracing::info!(
        target: "audit",
        event = "auth.logout",
        user_id = %principal.user_id,
        email = %principal.email,
    );
    Json(json!({ "message": "logged out" })).into_response()
}

/// External base URL for redirect URIs: forwarded headers first (the
/// gateway usually sits behind a proxy that terminates TLS), then the
/// configured external URL, then the bind address.
fn external_base_url(headers: &HeaderMap, state: &AppState) -> String {
    let forwarded_proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok());
    let forwarded_host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok());

    if let (Some(proto), Some(host)) = (forwarded_proto, forwarded_host) {
        // The proxy exposes the standard port, not the internal one.
        let host = host.split(':').next().unwrap_or(host);
        return format!("{proto}://{host}");
    }

    if let Some(external) = &state.config.server.external_url {
        return external.trim_end_matches('/').to_string();
    }

    format!(
        "http://{}:{}",
        state.config.server.host, state.config.server.port
    )
}

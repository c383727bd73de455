//! `Principal` — the authenticated user, as an Axum extractor.
//!
//! Tokens are accepted from `Authorization: Bearer <token>` or, as a
//! fallback for SSE clients that cannot set custom headers, a `token`
//! query parameter. The verified claims are resolved to the stored user
//! (by email) and the enabled flag is enforced here, so handlers always
//! see a live principal. Auth failures are plain HTTP 401s; they never
//! surface as JSON-RPC errors.

use std::collections::BTreeSet;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;

use tg_rbac::Permission;

use crate::api::api_error;
use crate::state::AppState;

/// The authenticated caller, carried explicitly down the call chain.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub provider: String,
    pub roles: BTreeSet<String>,
}

impl Principal {
    /// Authorize a generic permission; 403 on deny.
    pub fn require(&self, state: &AppState, permission: Permission) -> Result<(), Response> {
        if state.rbac.has_permission(&self.user_id, permission) {
            Ok(())
        } else {
            Err(api_error(
                StatusCode::FORBIDDEN,
                format!("missing permission: {permission}"),
            ))
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| query_token(parts))
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

        let claims = state
            .tokens
            .verify(&token)
            .map_err(|e| api_error(StatusCode::UNAUTHORIZED, e.to_string()))?;

        let user = state
            .store
            .get_user_by_email(&claims.email)
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "unknown user"))?;
        if !user.enabled {
            return Err(api_error(StatusCode::UNAUTHORIZED, "user disabled"));
        }

        Ok(Principal {
            user_id: user.user_id,
            email: user.email,
            name: user.name,
            provider: user.provider,
            roles: user.roles,
        })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// `?token=<token>` fallback. Tokens are base64url-safe, so no decoding
/// is needed.
fn query_token(parts: &Parts) -> Option<String> {
    parts
        .uri
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}

//! OAuth provider registry: the authorization-code flow against the
//! providers registered in the store.
//!
//! Each login mints a cryptographically random `state`, stored (with the
//! exchange redirect URI and an optional post-login redirect target) until
//! the callback consumes it. States expire after ten minutes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;

use tg_store::{GatewayStore, OAuthProviderRecord};

/// Pending `state` entries older than this are pruned.
const STATE_TTL: Duration = Duration::from_secs(600);

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);
const USERINFO_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the OAuth flow.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("OAuth provider not found: {0}")]
    ProviderNotFound(String),

    #[error("OAuth provider disabled: {0}")]
    ProviderDisabled(String),

    #[error("unknown or expired OAuth state")]
    StateMismatch,

    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error("userinfo request failed: {0}")]
    Userinfo(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Identity facts fetched from a provider's userinfo endpoint.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub email: Option<String>,
    pub name: Option<String>,
    /// The full userinfo document; group claims are extracted from here.
    pub raw: Value,
}

/// What the login endpoint hands back to the client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthorizationRequest {
    pub authorize_url: String,
    pub state: String,
}

/// Response from the token endpoint.
///
/// `Debug` is manually implemented to redact the tokens.
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

struct PendingState {
    provider_id: String,
    redirect_uri: String,
    redirect_to: Option<String>,
    created_at: Instant,
}

/// Registry over the store's OAuth providers plus in-flight login states.
pub struct OAuthRegistry {
    store: Arc<GatewayStore>,
    http: reqwest::Client,
    states: Mutex<HashMap<String, PendingState>>,
}

impl OAuthRegistry {
    pub fn new(store: Arc<GatewayStore>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn provider(&self, provider_id: &str) -> Result<OAuthProviderRecord, OAuthError> {
        let provider = self
            .store
            .get_oauth_provider(provider_id)
            .ok_or_else(|| OAuthError::ProviderNotFound(provider_id.into()))?;
        if !provider.enabled {
            return Err(OAuthError::ProviderDisabled(provider_id.into()));
        }
        Ok(provider)
    }

    /// Build the provider's authorization URL with a fresh random `state`.
    /// `redirect_to` is the optional cross-origin target the caller wants
    /// the user sent to after the callback completes.
    pub fn authorization_url(
        &self,
        provider_id: &str,
        redirect_uri: &str,
        redirect_to: Option<String>,
    ) -> Result<AuthorizationRequest, OAuthError> {
        let provider = self.provider(provider_id)?;

        // Two v4 UUIDs: 256 bits of CSPRNG-backed state.
        let state = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );

        let mut url = reqwest::Url::parse(&provider.authorize_url)
            .map_err(|e| OAuthError::Exchange(format!("invalid authorize_url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &provider.scopes.join(" "))
            .append_pair("state", &state);

        self.prune_states();
        self.states.lock().insert(
            state.clone(),
            PendingState {
                provider_id: provider_id.to_string(),
                redirect_uri: redirect_uri.to_string(),
                redirect_to,
                created_at: Instant::now(),
            },
        );

        tracing::info!(provider_id, "OAuth authorization URL issued");
        Ok(AuthorizationRequest {
            authorize_url: url.to_string(),
            state,
        })
    }

    /// Exchange the authorization code. Consumes the `state`; returns the
    /// provider, the token response, and the registered redirect target.
    pub async fn exchange_code(
        &self,
        code: &str,
        state: &str,
    ) -> Result<(OAuthProviderRecord, TokenResponse, Option<String>), OAuthError> {
        let pending = self
            .states
            .lock()
            .remove(state)
            .ok_or(OAuthError::StateMismatch)?;
        if pending.created_at.elapsed() > STATE_TTL {
            return Err(OAuthError::StateMismatch);
        }

        let provider = self.provider(&pending.provider_id)?;

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
        ];

        let resp = self
            .http
            .post(&provider.token_url)
            .form(&params)
            .header("Accept", "application/json")
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OAuthError::Exchange(format!("HTTP {status}: {body}")));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| OAuthError::Exchange(format!("invalid token response: {e}")))?;

        tracing::info!(provider_id = %provider.provider_id, "OAuth code exchanged");
        Ok((provider, token, pending.redirect_to))
    }

    /// Fetch the userinfo document.
    pub async fn fetch_userinfo(
        &self,
        provider: &OAuthProviderRecord,
        access_token: &str,
    ) -> Result<UserInfo, OAuthError> {
        let resp = self
            .http
            .get(&provider.userinfo_url)
            .bearer_auth(access_token)
            .timeout(USERINFO_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OAuthError::Userinfo(format!("HTTP {status}")));
        }

        let raw: Value = resp
            .json()
            .await
            .map_err(|e| OAuthError::Userinfo(format!("invalid userinfo body: {e}")))?;

        let email = raw
            .get("email")
            .or_else(|| raw.get("preferred_username"))
            .or_else(|| raw.get("upn"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let name = raw.get("name").and_then(Value::as_str).map(str::to_owned);

        Ok(UserInfo { email, name, raw })
    }

    fn prune_states(&self) {
        self.states
            .lock()
            .retain(|_, s| s.created_at.elapsed() < STATE_TTL);
    }
}

/// Extract the identity provider's group list from a userinfo document.
///
/// Claim names are searched in order; the first claim present wins. Values
/// may be arrays of strings or arrays of objects carrying a `name` field.
pub fn extract_groups(raw: &Value, claim_names: &[String]) -> Vec<String> {
    for claim in claim_names {
        let Some(value) = raw.get(claim) else {
            continue;
        };
        let Some(items) = value.as_array() else {
            continue;
        };
        let groups: Vec<String> = items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(str::to_owned),
                _ => None,
            })
            .collect();
        if !groups.is_empty() {
            return groups;
        }
    }
    Vec::new()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_names() -> Vec<String> {
        vec!["groups".into(), "roles".into(), "memberOf".into()]
    }

    #[test]
    fn extract_groups_from_string_array() {
        let raw = serde_json::json!({ "groups": ["sre", "ops"] });
        assert_eq!(extract_groups(&raw, &claim_names()), vec!["sre", "ops"]);
    }

    #[test]
    fn extract_groups_from_object_array() {
        let raw = serde_json::json!({
            "memberOf": [{ "name": "sre", "id": 1 }, { "name": "ops", "id": 2 }]
        });
        assert_eq!(extract_groups(&raw, &claim_names()), vec!["sre", "ops"]);
    }

    #[test]
    fn first_present_claim_wins() {
        let raw = serde_json::json!({ "groups": ["a"], "roles": ["b"] });
        assert_eq!(extract_groups(&raw, &claim_names()), vec!["a"]);
    }

    #[test]
    fn empty_claims_yield_no_groups() {
        let raw = serde_json::json!({ "email": "a@x.com" });
        assert!(extract_groups(&raw, &claim_names()).is_empty());
        let raw = serde_json::json!({ "groups": [] });
        assert!(extract_groups(&raw, &claim_names()).is_empty());
        let raw = serde_json::json!({ "groups": "not-an-array" });
        assert!(extract_groups(&raw, &claim_names()).is_empty());
    }

    #[test]
    fn authorization_url_carries_state_and_client() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GatewayStore::open(dir.path()).unwrap());
        store.save_oauth_provider(OAuthProviderRecord {
            provider_id: "corp".into(),
            provider_name: "Corp OIDC".into(),
            client_id: "cid".into(),
            client_secret: "secret".into(),
            authorize_url: "https://idp.example.com/authorize".into(),
            token_url: "https://idp.example.com/token".into(),
            userinfo_url: "https://idp.example.com/userinfo".into(),
            scopes: vec!["openid".into(), "profile".into()],
            enabled: true,
        });
        let registry = OAuthRegistry::new(store);

        let auth = registry
            .authorization_url("corp", "http://gw/auth/callback", None)
            .unwrap();
        assert!(auth.authorize_url.contains("client_id=cid"));
        assert!(auth.authorize_url.contains(&format!("state={}", auth.state)));
        assert!(auth.authorize_url.contains("scope=openid+profile"));
        assert_eq!(auth.state.len(), 64);
    }

    #[test]
    fn disabled_provider_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GatewayStore::open(dir.path()).unwrap());
        store.save_oauth_provider(OAuthProviderRecord {
            provider_id: "corp".into(),
            provider_name: "Corp".into(),
            client_id: "cid".into(),
            client_secret: "s".into(),
            authorize_url: "https://idp/authorize".into(),
            token_url: "https://idp/token".into(),
            userinfo_url: "https://idp/userinfo".into(),
            scopes: vec![],
            enabled: false,
        });
        let registry = OAuthRegistry::new(store);
        assert!(matches!(
            registry.authorization_url("corp", "http://gw/cb", None),
            Err(OAuthError::ProviderDisabled(_))
        ));
    }

    #[tokio::test]
    async fn unknown_state_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GatewayStore::open(dir.path()).unwrap());
        let registry = OAuthRegistry::new(store);
        assert!(matches!(
            registry.exchange_code("code", "bogus-state").await,
            Err(OAuthError::StateMismatch)
        ));
    }

    #[test]
    fn token_response_debug_redacts_secrets() {
        let resp = TokenResponse {
            access_token: "super-secret".into(),
            token_type: Some("bearer".into()),
            expires_in: Some(3600),
            id_token: Some("also-secret".into()),
        };
        let debug = format!("{resp:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("also-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}

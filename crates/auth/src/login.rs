//! The login pipeline: local password logins and the OAuth callback.
//!
//! The OAuth path is where group→role mapping happens:
//! 1. exchange the code, fetch userinfo
//! 2. upsert the user by case-insensitive email
//! 3. extract groups and resolve them through the provider's mapping table
//! 4. invalidate the user's permission-cache entry BEFORE touching roles
//! 5. a non-empty resolved set replaces the user's roles (group mapping is
//!    the source of truth); an empty set preserves existing roles so a
//!    misconfigured OIDC claim cannot lock out manually-assigned users
//! 6. apply the no-role policy (delete / disable / allow)
//! 7. issue a token and redirect

use std::collections::BTreeSet;
use std::sync::Arc;

use tg_domain::config::{AuthConfig, NoRolePolicy};
use tg_rbac::RbacEngine;
use tg_store::{GatewayStore, StoreError, UserRecord};

use crate::oauth::{extract_groups, AuthorizationRequest, OAuthError, OAuthRegistry};
use crate::token::TokenIssuer;

/// Errors surfaced by the login endpoints.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("OAuth provider returned no email")]
    MissingEmail,

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Login denied by policy; carries the redirect the handler should
    /// send the browser to.
    #[error("access denied")]
    AccessDenied { redirect_url: String },
}

/// Outcome of a successful local login.
#[derive(Debug)]
pub struct LocalLogin {
    pub access_token: String,
    pub user: UserRecord,
    pub role_names: Vec<String>,
}

/// Outcome of a successful OAuth callback: where to send the browser.
#[derive(Debug)]
pub struct CallbackRedirect {
    pub redirect_url: String,
}

/// Glue over the RBAC engine, token issuer, and OAuth registry.
pub struct LoginService {
    store: Arc<GatewayStore>,
    rbac: Arc<RbacEngine>,
    tokens: Arc<TokenIssuer>,
    oauth: Arc<OAuthRegistry>,
    no_role_policy: NoRolePolicy,
    group_claims: Vec<String>,
    default_redirect: String,
}

impl LoginService {
    pub fn new(
        store: Arc<GatewayStore>,
        rbac: Arc<RbacEngine>,
        tokens: Arc<TokenIssuer>,
        oauth: Arc<OAuthRegistry>,
        cfg: &AuthConfig,
    ) -> Self {
        Self {
            store,
            rbac,
            tokens,
            oauth,
            no_role_policy: cfg.no_role_policy,
            group_claims: cfg.group_claims.clone(),
            default_redirect: cfg.default_redirect.clone(),
        }
    }

    /// Verify email + password, bump `last_login`, issue a token.
    pub fn local_login(&self, email: &str, password: &str) -> Result<LocalLogin, LoginError> {
        let Some(user) = self.rbac.authenticate_local(email, password) else {
            tracing::warn!(
                target: "audit",
                event = "auth.login.failure",
                email,
                provider = "local",
                reason = "invalid_credentials",
            );
            return Err(LoginError::InvalidCredentials);
        };

        let access_token = self.tokens.issue(&user, "local");
        tracing::info!(
            target: "audit",
            event = "auth.login.success",
            user_id = %user.user_id,
            email = %user.email,
            provider = "local",
        );

        let role_names = self.role_names(&user);
        Ok(LocalLogin {
            access_token,
            user,
            role_names,
        })
    }

    /// Start an OAuth flow: authorize URL + state.
    pub fn begin_oauth(
        &self,
        provider_id: &str,
        redirect_uri: &str,
        redirect_to: Option<String>,
    ) -> Result<AuthorizationRequest, LoginError> {
        let auth = self
            .oauth
            .authorization_url(provider_id, redirect_uri, redirect_to)?;
        tracing::info!(
            target: "audit",
            event = "auth.login.initiated",
            provider = provider_id,
        );
        Ok(auth)
    }

    /// Handle the OAuth callback end to end. See the module docs for the
    /// pipeline.
    pub async fn oauth_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<CallbackRedirect, LoginError> {
        // 1. Exchange + userinfo.
        let (provider, token, redirect_to) = self.oauth.exchange_code(code, state).await?;
        let userinfo = self
            .oauth
            .fetch_userinfo(&provider, &token.access_token)
            .await?;
        let email = userinfo.email.as_deref().ok_or(LoginError::MissingEmail)?;

        // 2. Upsert by email.
        let user = self
            .rbac
            .get_or_create_user(email, userinfo.name.clone(), &provider.provider_id)?;

        // 3–5. Groups → roles, with cache invalidation before the change.
        let groups = extract_groups(&userinfo.raw, &self.group_claims);
        let user = self.sync_roles_from_groups(&user, &provider.provider_id, &groups)?;
        if user.roles.is_empty() {
            if let Some(redirect_url) = self.apply_no_role_policy(
                &user,
                &provider.provider_id,
                &groups,
                redirect_to.clone(),
            )? {
                return Err(LoginError::AccessDenied { redirect_url });
            }
        }

        // 7. Token + redirect.
        let access_token = self.tokens.issue(&user, &provider.provider_id);
        tracing::info!(
            target: "audit",
            event = "auth.login.success",
            user_id = %user.user_id,
            email = %user.email,
            provider = %provider.provider_id,
        );

        let base = redirect_to.unwrap_or_else(|| self.default_redirect.clone());
        Ok(CallbackRedirect {
            redirect_url: append_query(&base, &[("token", &access_token)]),
        })
    }

    /// Resolve groups through the provider's mapping table and apply the
    /// result to the user's role set. A non-empty resolution replaces the
    /// roles; an empty one preserves them. The user's cache entry is
    /// invalidated before any change. Returns the refreshed record.
    pub fn sync_roles_from_groups(
        &self,
        user: &UserRecord,
        provider_id: &str,
        groups: &[String],
    ) -> Result<UserRecord, LoginError> {
        let role_ids: BTreeSet<String> = if groups.is_empty() {
            BTreeSet::new()
        } else {
            self.store.roles_for_groups(provider_id, groups)
        };
        tracing::info!(
            email = %user.email,
            provider = provider_id,
            groups = ?groups,
            mapped_roles = ?role_ids,
            "OAuth groups resolved"
        );

        self.rbac.invalidate_user(&user.user_id);

        if !role_ids.is_empty() {
            let old_roles = user.roles.clone();
            self.store.clear_user_roles(&user.user_id);
            for role_id in &role_ids {
                match self.rbac.assign_role(&user.user_id, role_id) {
                    Ok(_) => {}
                    Err(StoreError::RoleNotFound(_)) => {
                        tracing::warn!(
                            role_id,
                            "group mapping points at a deleted role, skipping"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            tracing::info!(
                email = %user.email,
                old_roles = ?old_roles,
                new_roles = ?role_ids,
                "roles replaced from group mappings"
            );
        } else {
            tracing::info!(
                email = %user.email,
                existing_roles = ?user.roles,
                "no group mappings matched, preserving existing roles"
            );
        }

        self.store
            .get_user(&user.user_id)
            .ok_or_else(|| StoreError::UserNotFound(user.user_id.clone()).into())
    }

    /// Returns the denial redirect when the policy blocks the login, `None`
    /// when `allow` lets a role-less user through.
    fn apply_no_role_policy(
        &self,
        user: &UserRecord,
        provider_id: &str,
        groups: &[String],
        redirect_to: Option<String>,
    ) -> Result<Option<String>, LoginError> {
        if self.no_role_policy == NoRolePolicy::Allow {
            return Ok(None);
        }

        tracing::warn!(
            target: "audit",
            event = "auth.login.failure",
            user_id = %user.user_id,
            email = %user.email,
            provider = provider_id,
            reason = "no_role_mapping",
            extracted_groups = ?groups,
        );

        match self.no_role_policy {
            NoRolePolicy::Delete => {
                // No roles means no access; drop the just-created record
                // rather than accumulating orphans.
                self.rbac.delete_user(&user.user_id);
                tracing::info!(email = %user.email, "deleted user with no role mappings");
            }
            NoRolePolicy::Disable => {
                self.rbac.set_user_enabled(&user.user_id, false)?;
                tracing::info!(email = %user.email, "disabled user with no role mappings");
            }
            NoRolePolicy::Allow => unreachable!("handled above"),
        }

        let message = "Access denied: your account is not authorized. \
                       Ask an administrator to configure group-to-role mappings.";
        let base = redirect_to.unwrap_or_else(|| "/auth/login".to_string());
        Ok(Some(append_query(
            &base,
            &[("error", "access_denied"), ("message", message)],
        )))
    }

    fn role_names(&self, user: &UserRecord) -> Vec<String> {
        user.roles
            .iter()
            .filter_map(|rid| self.store.get_role(rid))
            .map(|r| r.role_name)
            .collect()
    }
}

/// Append query parameters to a URL or path, percent-encoding values.
/// Handles targets that already carry a query string.
pub fn append_query(base: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = String::from(base);
    for (i, (key, value)) in pairs.iter().enumerate() {
        out.push(if i == 0 && !base.contains('?') { '?' } else { '&' });
        out.push_str(key);
        out.push('=');
        out.push_str(&percent_encode(value));
    }
    out
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tg_rbac::PermissionCache;

    fn service(policy: NoRolePolicy) -> (tempfile::TempDir, LoginService, Arc<RbacEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GatewayStore::open(dir.path()).unwrap());
        let rbac = Arc::new(RbacEngine::new(
            store.clone(),
            PermissionCache::new(Duration::from_secs(300), 1000),
        ));
        rbac.ensure_defaults().unwrap();
        let tokens = Arc::new(TokenIssuer::new(b"test".to_vec(), 3600));
        let oauth = Arc::new(OAuthRegistry::new(store.clone()));
        let cfg = AuthConfig {
            no_role_policy: policy,
            ..AuthConfig::default()
        };
        let service = LoginService::new(store, rbac.clone(), tokens, oauth, &cfg);
        (dir, service, rbac)
    }

    #[test]
    fn local_login_issues_verifiable_token() {
        let (_dir, service, _rbac) = service(NoRolePolicy::Delete);
        let login = service.local_login("admin", "admin").unwrap();
        assert!(!login.access_token.is_empty());
        assert_eq!(login.role_names, vec!["Administrator".to_string()]);
    }

    #[test]
    fn local_login_rejects_wrong_password() {
        let (_dir, service, _rbac) = service(NoRolePolicy::Delete);
        assert!(matches!(
            service.local_login("admin", "wrong"),
            Err(LoginError::InvalidCredentials)
        ));
    }

    #[test]
    fn group_mappings_replace_roles_exactly() {
        let (_dir, service, rbac) = service(NoRolePolicy::Delete);
        for role_id in ["role_sre", "role_ops"] {
            rbac.create_role(role_id, "", BTreeSet::new()).unwrap();
        }
        for (group, role_id) in [("sre", "role_sre"), ("ops", "role_ops")] {
            service.store.add_group_mapping(tg_store::GroupMapping {
                provider_id: "corp".into(),
                group_name: group.into(),
                role_id: role_id.into(),
            });
        }
        let user = rbac
            .get_or_create_user("eve@example.com", None, "corp")
            .unwrap();
        // A manually assigned role that the mapping should replace.
        rbac.assign_role(&user.user_id, "admin").unwrap();

        let user = service
            .sync_roles_from_groups(&user, "corp", &["sre".into(), "ops".into()])
            .unwrap();
        assert_eq!(
            user.roles,
            BTreeSet::from(["role_ops".to_string(), "role_sre".to_string()])
        );

        // A second login with no groups preserves what's there.
        let user = service.sync_roles_from_groups(&user, "corp", &[]).unwrap();
        assert_eq!(
            user.roles,
            BTreeSet::from(["role_ops".to_string(), "role_sre".to_string()])
        );
    }

    #[test]
    fn unmatched_groups_preserve_manual_roles() {
        let (_dir, service, rbac) = service(NoRolePolicy::Delete);
        let user = rbac
            .get_or_create_user("frank@example.com", None, "corp")
            .unwrap();
        rbac.assign_role(&user.user_id, "admin").unwrap();

        let user = service
            .sync_roles_from_groups(&user, "corp", &["unmapped-group".into()])
            .unwrap();
        assert_eq!(user.roles, BTreeSet::from(["admin".to_string()]));
    }

    #[test]
    fn append_query_encodes_and_chains() {
        assert_eq!(
            append_query("/", &[("token", "a.b/c")]),
            "/?token=a.b%2Fc"
        );
        assert_eq!(
            append_query("http://app/cb?x=1", &[("error", "denied"), ("message", "no role")]),
            "http://app/cb?x=1&error=denied&message=no%20role"
        );
    }
}

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the token signing secret.
    /// If unset, a random per-process secret is generated and tokens do
    /// not survive a restart.
    #[serde(default = "d_token_secret_env")]
    pub token_secret_env: String,
    /// Bearer token lifetime in seconds.
    #[serde(default = "d_token_ttl")]
    pub token_ttl_secs: u64,
    /// What to do with an OAuth login whose group mappings resolve to no
    /// roles at all.
    #[serde(default)]
    pub no_role_policy: NoRolePolicy,
    /// Claim names searched (in order) for the identity provider's group
    /// list. Values may be arrays of strings or arrays of objects with a
    /// `name` field.
    #[serde(default = "d_group_claims")]
    pub group_claims: Vec<String>,
    /// Landing page clients are redirected to after an OAuth login when no
    /// cross-origin redirect was registered with the state.
    #[serde(default = "d_landing")]
    pub default_redirect: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret_env: d_token_secret_env(),
            token_ttl_secs: d_token_ttl(),
            no_role_policy: NoRolePolicy::default(),
            group_claims: d_group_claims(),
            default_redirect: d_landing(),
        }
    }
}

/// Policy applied when an OAuth login resolves to zero roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoRolePolicy {
    /// Deny the login and delete the just-upserted user.
    #[default]
    Delete,
    /// Deny the login but keep the user around, disabled.
    Disable,
    /// Allow the login with no roles (deny-by-default still applies to
    /// every tool call).
    Allow,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_token_secret_env() -> String {
    "TG_TOKEN_SECRET".into()
}
fn d_token_ttl() -> u64 {
    8 * 3600
}
fn d_group_claims() -> Vec<String> {
    vec!["groups".into(), "roles".into(), "memberOf".into()]
}
fn d_landing() -> String {
    "/".into()
}

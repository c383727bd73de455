//! Persistent entity records.
//!
//! These are storage shapes, not decision shapes: permissions are plain
//! strings here, and the RBAC engine owns the closed permission set.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Users
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A gateway user. Local users carry a password hash; OAuth users never do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    /// Unique, compared case-insensitively.
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    /// `"local"` or an OAuth provider id.
    pub provider: String,
    /// SHA-256 hex digest. Present iff `provider == "local"`.
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default = "d_true")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// Fresh record with a generated `user_id`, no roles, enabled.
    pub fn new(email: impl Into<String>, name: Option<String>, provider: impl Into<String>) -> Self {
        Self {
            user_id: format!("user_{}", uuid::Uuid::new_v4().simple()),
            email: email.into(),
            name,
            provider: provider.into(),
            password_hash: None,
            roles: BTreeSet::new(),
            enabled: true,
            created_at: Utc::now(),
            last_login: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles & grants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A role: a named bundle of permission strings.
///
/// System roles (`admin`) cannot be edited or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRecord {
    pub role_id: String,
    pub role_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Grants a role execute rights on one tool of one backend server.
/// Absence of a grant denies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolGrant {
    pub role_id: String,
    pub server_id: String,
    pub tool_name: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend servers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registered MCP backend.
///
/// The URL's path suffix selects the transport: `/sse` means the long-lived
/// SSE transport, anything else the short-lived HTTP-POST transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServer {
    pub server_id: String,
    pub url: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OAuth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A configured OAuth/OIDC identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderRecord {
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

/// Maps one identity-provider group to one gateway role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMapping {
    pub provider_id: String,
    pub group_name: String,
    pub role_id: String,
}

/// Associates a tool with an OAuth provider (annotation-only metadata,
/// surfaced on the aggregated tool list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOAuthAssociation {
    pub server_id: String,
    pub tool_name: String,
    pub provider_id: String,
}

fn d_true() -> bool {
    true
}

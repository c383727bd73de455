//! The closed permission set.
//!
//! Permissions are `<resource>:<verb>` tokens. The store keeps them as
//! plain strings; everything decision-making goes through this enum so an
//! unknown token can never grant anything.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    // MCP server administration
    #[serde(rename = "server:view")]
    ServerView,
    #[serde(rename = "server:add")]
    ServerAdd,
    #[serde(rename = "server:edit")]
    ServerEdit,
    #[serde(rename = "server:delete")]
    ServerDelete,
    #[serde(rename = "server:test")]
    ServerTest,

    // Tools
    #[serde(rename = "tool:view")]
    ToolView,
    #[serde(rename = "tool:execute")]
    ToolExecute,
    #[serde(rename = "tool:manage")]
    ToolManage,

    // Configuration
    #[serde(rename = "config:view")]
    ConfigView,
    #[serde(rename = "config:edit")]
    ConfigEdit,

    // User management
    #[serde(rename = "user:view")]
    UserView,
    #[serde(rename = "user:manage")]
    UserManage,

    // Role management
    #[serde(rename = "role:view")]
    RoleView,
    #[serde(rename = "role:manage")]
    RoleManage,

    // Audit
    #[serde(rename = "audit:view")]
    AuditView,

    // OAuth administration
    #[serde(rename = "oauth:manage")]
    OAuthManage,
}

impl Permission {
    /// Every permission in the system; the `admin` role carries all of them.
    pub const ALL: [Permission; 16] = [
        Permission::ServerView,
        Permission::ServerAdd,
        Permission::ServerEdit,
        Permission::ServerDelete,
        Permission::ServerTest,
        Permission::ToolView,
        Permission::ToolExecute,
        Permission::ToolManage,
        Permission::ConfigView,
        Permission::ConfigEdit,
        Permission::UserView,
        Permission::UserManage,
        Permission::RoleView,
        Permission::RoleManage,
        Permission::AuditView,
        Permission::OAuthManage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ServerView => "server:view",
            Permission::ServerAdd => "server:add",
            Permission::ServerEdit => "server:edit",
            Permission::ServerDelete => "server:delete",
            Permission::ServerTest => "server:test",
            Permission::ToolView => "tool:view",
            Permission::ToolExecute => "tool:execute",
            Permission::ToolManage => "tool:manage",
            Permission::ConfigView => "config:view",
            Permission::ConfigEdit => "config:edit",
            Permission::UserView => "user:view",
            Permission::UserManage => "user:manage",
            Permission::RoleView => "role:view",
            Permission::RoleManage => "role:manage",
            Permission::AuditView => "audit:view",
            Permission::OAuthManage => "oauth:manage",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownPermission(s.to_string()))
    }
}

/// A token outside the closed set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown permission: {0}")]
pub struct UnknownPermission(pub String);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn round_trips_through_strings() {
        for p in Permission::ALL {
            assert_eq!(Permission::from_str(p.as_str()).unwrap(), p);
        }
    }

    #[test]
    fn unknown_token_rejected() {
        assert!(Permission::from_str("tool:destroy").is_err());
        assert!(Permission::from_str("").is_err());
    }

    #[test]
    fn serde_uses_wire_form() {
        let json = serde_json::to_string(&Permission::ToolExecute).unwrap();
        assert_eq!(json, "\"tool:execute\"");
        let back: Permission = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Permission::ToolExecute);
    }
}

mod auth;
mod backends;
mod cache;
mod server;
mod state;

pub use auth::*;
pub use backends::*;
pub use cache::*;
pub use server::*;
pub use state::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub permission_cache: PermissionCacheConfig,
}

impl Config {
    /// Validate the configuration, returning every issue found.
    ///
    /// The caller decides whether warnings are fatal; boot aborts on any
    /// error-severity issue.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port", "port must be non-zero"));
        }
        if self.auth.token_ttl_secs == 0 {
            issues.push(ConfigIssue::error(
                "auth.token_ttl_secs",
                "token lifetime must be non-zero",
            ));
        }
        if self.permission_cache.max_entries == 0 {
            issues.push(ConfigIssue::error(
                "permission_cache.max_entries",
                "cache capacity must be non-zero",
            ));
        }
        if self.health.check_interval_secs < 5 {
            issues.push(ConfigIssue::warning(
                "health.check_interval_secs",
                "intervals under 5s hammer backends with probe traffic",
            ));
        }
        if self.auth.group_claims.is_empty() {
            issues.push(ConfigIssue::warning(
                "auth.group_claims",
                "no group claim names configured; OAuth logins will never map roles",
            ));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

//! The RBAC engine: deny-by-default decisions over users, roles, and
//! per-tool role grants.
//!
//! Every decision goes through the permission cache; population is
//! read-through (fetch user, union role permissions, derive the admin /
//! tool-execute / tool-manage booleans). Every mutation that can change a
//! decision invalidates the affected entries — per-user where the user is
//! known, per-role (with a full-clear fallback) where a role changed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};

use tg_store::{GatewayStore, RoleRecord, StoreError, StoreResult, ToolGrant, UserRecord};

use crate::cache::{CacheStats, PermissionCache, PermissionSnapshot};
use crate::permission::Permission;

/// What a user may run on one server.
///
/// `Unrestricted` is distinct from an empty allow-list: admins and
/// `tool:manage` holders see everything, while a user whose grants cover
/// none of the server's tools sees nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAccess {
    Unrestricted,
    Restricted(BTreeSet<String>),
}

/// Role-based access control engine. One per process, shared via `Arc`.
pub struct RbacEngine {
    store: Arc<GatewayStore>,
    cache: PermissionCache,
}

impl RbacEngine {
    pub fn new(store: Arc<GatewayStore>, cache: PermissionCache) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<GatewayStore> {
        &self.store
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Seed the system `admin` role, and a default `admin`/`admin` local
    /// user when the store holds no users at all.
    pub fn ensure_defaults(&self) -> StoreResult<()> {
        if self.store.get_role("admin").is_none() {
            let now = Utc::now();
            self.store.save_role(RoleRecord {
                role_id: "admin".into(),
                role_name: "Administrator".into(),
                description: "Full system access".into(),
                permissions: Permission::ALL.iter().map(|p| p.as_str().to_string()).collect(),
                is_system: true,
                created_at: now,
                updated_at: now,
            })?;
            tracing::info!("created system admin role");
        }

        if self.store.list_users().is_empty() {
            tracing::info!("no users found, creating default admin user");
            self.create_local_user(
                "admin",
                "admin",
                Some("Administrator".into()),
                BTreeSet::from(["admin".to_string()]),
            )?;
            tracing::warn!("default admin user created with email 'admin' and password 'admin'");
            tracing::warn!("change this password immediately after first login");
        }

        Ok(())
    }

    // ── Cache population ─────────────────────────────────────────────

    /// Resolved permissions for a user, through the cache. `None` when the
    /// user does not exist.
    pub fn snapshot(&self, user_id: &str) -> Option<PermissionSnapshot> {
        if let Some(cached) = self.cache.get(user_id) {
            return Some(cached);
        }

        let user = self.store.get_user(user_id)?;
        let roles: Vec<String> = user.roles.iter().cloned().collect();
        let is_admin = user.roles.contains("admin");

        let mut permissions = BTreeSet::new();
        for role_id in &user.roles {
            if let Some(role) = self.store.get_role(role_id) {
                permissions.extend(role.permissions.iter().cloned());
            }
        }

        let snapshot = PermissionSnapshot {
            enabled: user.enabled,
            has_tool_execute: is_admin
                || permissions.contains(Permission::ToolExecute.as_str()),
            has_tool_manage: is_admin
                || permissions.contains(Permission::ToolManage.as_str()),
            roles,
            is_admin,
            permissions,
            email: user.email,
        };

        self.cache.set(user_id, snapshot.clone());
        tracing::debug!(user_id, "built permission cache entry");
        Some(snapshot)
    }

    // ── Decisions ────────────────────────────────────────────────────

    /// Generic permission check. Deny for unknown or disabled users;
    /// admins hold every permission implicitly.
    pub fn has_permission(&self, user_id: &str, permission: Permission) -> bool {
        let Some(snapshot) = self.snapshot(user_id) else {
            return false;
        };
        if !snapshot.enabled {
            return false;
        }
        if snapshot.is_admin {
            return true;
        }
        snapshot.permissions.contains(permission.as_str())
    }

    /// Every permission a user effectively holds.
    pub fn user_permissions(&self, user_id: &str) -> Vec<Permission> {
        let Some(snapshot) = self.snapshot(user_id) else {
            return Vec::new();
        };
        if !snapshot.enabled {
            return Vec::new();
        }
        if snapshot.is_admin {
            return Permission::ALL.to_vec();
        }
        snapshot
            .permissions
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect()
    }

    /// Deny-by-default tool execution decision:
    /// 1. unknown/disabled user → deny
    /// 2. admin → allow
    /// 3. missing `tool:execute` → deny
    /// 4. `tool:manage` → allow
    /// 5. else allow iff any of the user's roles has a grant for
    ///    `(server_id, tool_name)`
    pub fn can_execute_tool(&self, user_id: &str, server_id: &str, tool_name: &str) -> bool {
        let Some(snapshot) = self.snapshot(user_id) else {
            tracing::warn!(user_id, "tool access denied: user not found");
            return false;
        };
        if !snapshot.enabled {
            tracing::warn!(user_id, "tool access denied: user disabled");
            return false;
        }
        if snapshot.is_admin {
            return true;
        }
        if !snapshot.has_tool_execute {
            tracing::debug!(user_id, tool_name, "tool access denied: no tool:execute");
            return false;
        }
        if snapshot.has_tool_manage {
            return true;
        }

        for role_id in &snapshot.roles {
            let granted = self.store.role_tools_on_server(role_id, server_id);
            if granted.contains(tool_name) {
                return true;
            }
        }

        tracing::info!(
            user = %snapshot.email,
            server_id,
            tool_name,
            roles = ?snapshot.roles,
            "tool access denied: no matching grant"
        );
        false
    }

    /// The set of tools a user may run on one server.
    ///
    /// Admins and `tool:manage` holders are unrestricted. A role with no
    /// grants recorded anywhere is treated as unrestricted (a role with no
    /// policy means full access, kept for compatibility); once every role
    /// has grants, the union of this server's grants is the exact
    /// allow-list.
    pub fn allowed_tools(&self, user_id: &str, server_id: &str) -> ToolAccess {
        let Some(snapshot) = self.snapshot(user_id) else {
            return ToolAccess::Restricted(BTreeSet::new());
        };
        if !snapshot.enabled {
            return ToolAccess::Restricted(BTreeSet::new());
        }
        if snapshot.is_admin || snapshot.has_tool_manage {
            return ToolAccess::Unrestricted;
        }

        let mut allowed = BTreeSet::new();
        for role_id in &snapshot.roles {
            let on_server = self.store.role_tools_on_server(role_id, server_id);
            if on_server.is_empty() {
                if self.store.grants_for_role(role_id).is_empty() {
                    return ToolAccess::Unrestricted;
                }
            } else {
                allowed.extend(on_server);
            }
        }
        ToolAccess::Restricted(allowed)
    }

    // ── Role management ──────────────────────────────────────────────

    /// Create a role. The id is a slug of the name; a name with no usable
    /// characters gets a random id.
    pub fn create_role(
        &self,
        role_name: &str,
        description: &str,
        permissions: BTreeSet<Permission>,
    ) -> StoreResult<RoleRecord> {
        let mut role_id = slugify(role_name);
        if role_id.is_empty() {
            role_id = format!("role_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        }

        let now = Utc::now();
        let role = RoleRecord {
            role_id,
            role_name: role_name.to_string(),
            description: description.to_string(),
            permissions: permissions.iter().map(|p| p.as_str().to_string()).collect(),
            is_system: false,
            created_at: now,
            updated_at: now,
        };
        self.store.save_role(role.clone())?;
        tracing::info!(role_id = %role.role_id, role_name, "created role");
        Ok(role)
    }

    /// Update a non-system role and invalidate every user carrying it.
    pub fn update_role(
        &self,
        role_id: &str,
        role_name: Option<String>,
        description: Option<String>,
        permissions: Option<BTreeSet<Permission>>,
    ) -> StoreResult<RoleRecord> {
        let mut role = self
            .store
            .get_role(role_id)
            .ok_or_else(|| StoreError::RoleNotFound(role_id.into()))?;
        if role.is_system {
            return Err(StoreError::SystemRole(role_id.into()));
        }

        if let Some(name) = role_name {
            role.role_name = name;
        }
        if let Some(desc) = description {
            role.description = desc;
        }
        if let Some(perms) = permissions {
            role.permissions = perms.iter().map(|p| p.as_str().to_string()).collect();
        }
        role.updated_at = Utc::now();
        self.store.save_role(role.clone())?;

        self.invalidate_role(role_id);
        tracing::info!(role_id, "updated role");
        Ok(role)
    }

    /// Delete a role. Invalidation happens BEFORE deletion so carriers can
    /// still be enumerated; the store cascades assignments and grants.
    pub fn delete_role(&self, role_id: &str) -> StoreResult<bool> {
        self.invalidate_role(role_id);
        let deleted = self.store.delete_role(role_id)?;
        if deleted {
            tracing::info!(role_id, "deleted role");
        }
        Ok(deleted)
    }

    pub fn assign_role(&self, user_id: &str, role_id: &str) -> StoreResult<bool> {
        let assigned = self.store.assign_role(user_id, role_id)?;
        if assigned {
            self.cache.invalidate_user(user_id);
            tracing::info!(user_id, role_id, "assigned role");
        }
        Ok(assigned)
    }

    pub fn revoke_role(&self, user_id: &str, role_id: &str) -> bool {
        let revoked = self.store.revoke_role(user_id, role_id);
        if revoked {
            self.cache.invalidate_user(user_id);
            tracing::info!(user_id, role_id, "revoked role");
        }
        revoked
    }

    // ── Role-tool grants ─────────────────────────────────────────────

    pub fn add_tool_grant(&self, grant: ToolGrant) -> bool {
        let role_id = grant.role_id.clone();
        let added = self.store.add_grant(grant);
        if added {
            self.invalidate_role(&role_id);
        }
        added
    }

    pub fn remove_tool_grant(&self, grant: &ToolGrant) -> bool {
        let removed = self.store.remove_grant(grant);
        if removed {
            self.invalidate_role(&grant.role_id);
        }
        removed
    }

    /// Replace all grants of a role.
    pub fn set_role_grants(&self, role_id: &str, grants: Vec<ToolGrant>) {
        self.store.set_role_grants(role_id, grants);
        self.invalidate_role(role_id);
    }

    // ── User management ──────────────────────────────────────────────

    pub fn create_local_user(
        &self,
        email: &str,
        password: &str,
        name: Option<String>,
        roles: BTreeSet<String>,
    ) -> StoreResult<UserRecord> {
        let mut user = UserRecord::new(email, name, "local");
        user.password_hash = Some(hash_password(password));
        self.store.save_user(user.clone())?;

        for role_id in &roles {
            self.store.assign_role(&user.user_id, role_id)?;
        }
        tracing::info!(email, user_id = %user.user_id, "created local user");
        self.store
            .get_user(&user.user_id)
            .ok_or_else(|| StoreError::UserNotFound(user.user_id))
    }

    /// Verify a local user's password. `None` on any failure: unknown
    /// email, non-local provider, disabled account, wrong password.
    pub fn authenticate_local(&self, email: &str, password: &str) -> Option<UserRecord> {
        let user = self.store.get_user_by_email(email)?;
        if user.provider != "local" {
            tracing::warn!(email, "local login rejected: not a local user");
            return None;
        }
        if !user.enabled {
            tracing::warn!(email, "local login rejected: user disabled");
            return None;
        }
        let hash = user.password_hash.as_deref()?;
        if !verify_password(password, hash) {
            tracing::warn!(email, "local login rejected: invalid password");
            return None;
        }
        self.store.update_last_login(&user.user_id);
        tracing::info!(email, "local user authenticated");
        Some(user)
    }

    /// Change a local user's password.
    pub fn update_password(&self, user_id: &str, new_password: &str) -> StoreResult<()> {
        let user = self
            .store
            .get_user(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.into()))?;
        if user.provider != "local" {
            return Err(StoreError::UserNotFound(format!(
                "{user_id} is not a local user"
            )));
        }
        self.store
            .set_password_hash(user_id, hash_password(new_password))?;
        tracing::info!(user_id, "password updated");
        Ok(())
    }

    /// Upsert a user by (case-insensitive) email; used by OAuth logins.
    pub fn get_or_create_user(
        &self,
        email: &str,
        name: Option<String>,
        provider: &str,
    ) -> StoreResult<UserRecord> {
        if let Some(user) = self.store.get_user_by_email(email) {
            self.store.update_last_login(&user.user_id);
            return Ok(user);
        }
        let user = UserRecord::new(email, name, provider);
        self.store.save_user(user.clone())?;
        self.store.update_last_login(&user.user_id);
        tracing::info!(email, user_id = %user.user_id, provider, "created user");
        Ok(user)
    }

    /// Enable or disable a user; `enabled` feeds every decision, so the
    /// entry is invalidated.
    pub fn set_user_enabled(&self, user_id: &str, enabled: bool) -> StoreResult<()> {
        self.store.set_user_enabled(user_id, enabled)?;
        self.cache.invalidate_user(user_id);
        tracing::info!(user_id, enabled, "user enabled flag changed");
        Ok(())
    }

    /// Delete a user; invalidation first, so no stale grant survives.
    pub fn delete_user(&self, user_id: &str) -> bool {
        self.cache.invalidate_user(user_id);
        let deleted = self.store.delete_user(user_id);
        if deleted {
            tracing::info!(user_id, "deleted user");
        }
        deleted
    }

    /// Invalidate the cache entry of one user (used by the login pipeline
    /// before it touches roles).
    pub fn invalidate_user(&self, user_id: &str) {
        self.cache.invalidate_user(user_id);
    }

    fn invalidate_role(&self, role_id: &str) {
        let store = self.store.clone();
        self.cache.invalidate_by_role(role_id, move |rid| {
            Ok::<_, StoreError>(store.users_with_role(rid))
        });
    }
}

// ── Password hashing ─────────────────────────────────────────────────

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn verify_password(password: &str, password_hash: &str) -> bool {
    hash_password(password) == password_hash
}

/// Slug a role name: lowercase, spaces/hyphens to underscores, everything
/// outside `[a-z0-9_]` stripped.
fn slugify(name: &str) -> String {
    static NON_SLUG: OnceLock<Regex> = OnceLock::new();
    let re = NON_SLUG.get_or_init(|| Regex::new(r"[^a-z0-9_]").unwrap());
    let lowered = name.to_lowercase().replace([' ', '-'], "_");
    re.replace_all(&lowered, "").into_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> (tempfile::TempDir, RbacEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GatewayStore::open(dir.path()).unwrap());
        let engine = RbacEngine::new(
            store,
            PermissionCache::new(Duration::from_secs(300), 1000),
        );
        engine.ensure_defaults().unwrap();
        (dir, engine)
    }

    fn ops_user(engine: &RbacEngine) -> UserRecord {
        let ops = engine
            .create_role(
                "ops",
                "operators",
                BTreeSet::from([Permission::ToolExecute, Permission::ToolView]),
            )
            .unwrap();
        engine
            .create_local_user(
                "alice@example.com",
                "pw",
                None,
                BTreeSet::from([ops.role_id]),
            )
            .unwrap()
    }

    #[test]
    fn defaults_create_admin_role_and_user() {
        let (_dir, engine) = engine();
        let admin_role = engine.store().get_role("admin").unwrap();
        assert!(admin_role.is_system);
        assert_eq!(admin_role.permissions.len(), Permission::ALL.len());

        let admin = engine.authenticate_local("admin", "admin").unwrap();
        assert!(engine.can_execute_tool(&admin.user_id, "any", "anything"));
    }

    #[test]
    fn deny_by_default_without_grant() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        assert!(!engine.can_execute_tool(&alice.user_id, "s1", "sum"));
    }

    #[test]
    fn grant_allows_exactly_that_tool() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        engine.add_tool_grant(ToolGrant {
            role_id: "ops".into(),
            server_id: "s1".into(),
            tool_name: "sum".into(),
        });
        assert!(engine.can_execute_tool(&alice.user_id, "s1", "sum"));
        assert!(!engine.can_execute_tool(&alice.user_id, "s1", "mul"));
        assert!(!engine.can_execute_tool(&alice.user_id, "s2", "sum"));
    }

    #[test]
    fn decision_is_stable_across_cache_warmup() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        engine.add_tool_grant(ToolGrant {
            role_id: "ops".into(),
            server_id: "s1".into(),
            tool_name: "sum".into(),
        });
        let cold = engine.can_execute_tool(&alice.user_id, "s1", "sum");
        let warm = engine.can_execute_tool(&alice.user_id, "s1", "sum");
        assert_eq!(cold, warm);
        assert!(engine.cache_stats().hits >= 1);
    }

    #[test]
    fn missing_tool_execute_denies_despite_grant() {
        let (_dir, engine) = engine();
        let viewer = engine
            .create_role("viewer", "", BTreeSet::from([Permission::ToolView]))
            .unwrap();
        let bob = engine
            .create_local_user("bob@example.com", "pw", None, BTreeSet::from([viewer.role_id]))
            .unwrap();
        engine.add_tool_grant(ToolGrant {
            role_id: "viewer".into(),
            server_id: "s1".into(),
            tool_name: "sum".into(),
        });
        assert!(!engine.can_execute_tool(&bob.user_id, "s1", "sum"));
    }

    #[test]
    fn tool_manage_bypasses_grants() {
        let (_dir, engine) = engine();
        let mgr = engine
            .create_role(
                "tool manager",
                "",
                BTreeSet::from([Permission::ToolExecute, Permission::ToolManage]),
            )
            .unwrap();
        assert_eq!(mgr.role_id, "tool_manager");
        let carol = engine
            .create_local_user("carol@example.com", "pw", None, BTreeSet::from([mgr.role_id]))
            .unwrap();
        assert!(engine.can_execute_tool(&carol.user_id, "s1", "anything"));
        assert_eq!(
            engine.allowed_tools(&carol.user_id, "s1"),
            ToolAccess::Unrestricted
        );
    }

    #[test]
    fn disabled_user_denied_everything() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        engine.add_tool_grant(ToolGrant {
            role_id: "ops".into(),
            server_id: "s1".into(),
            tool_name: "sum".into(),
        });
        assert!(engine.can_execute_tool(&alice.user_id, "s1", "sum"));

        engine.set_user_enabled(&alice.user_id, false).unwrap();
        assert!(!engine.can_execute_tool(&alice.user_id, "s1", "sum"));
        assert!(!engine.has_permission(&alice.user_id, Permission::ToolView));
    }

    #[test]
    fn role_mutation_is_visible_through_cache() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        // Warm the cache.
        assert!(engine.has_permission(&alice.user_id, Permission::ToolExecute));

        engine
            .update_role(
                "ops",
                None,
                None,
                Some(BTreeSet::from([Permission::ToolView])),
            )
            .unwrap();
        assert!(!engine.has_permission(&alice.user_id, Permission::ToolExecute));
    }

    #[test]
    fn grant_change_invalidates_role_carriers() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        assert!(!engine.can_execute_tool(&alice.user_id, "s1", "sum"));

        engine.add_tool_grant(ToolGrant {
            role_id: "ops".into(),
            server_id: "s1".into(),
            tool_name: "sum".into(),
        });
        assert!(engine.can_execute_tool(&alice.user_id, "s1", "sum"));

        engine.remove_tool_grant(&ToolGrant {
            role_id: "ops".into(),
            server_id: "s1".into(),
            tool_name: "sum".into(),
        });
        assert!(!engine.can_execute_tool(&alice.user_id, "s1", "sum"));
    }

    #[test]
    fn role_with_no_grants_anywhere_is_unrestricted() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        // `ops` has zero grants recorded: legacy full access.
        assert_eq!(
            engine.allowed_tools(&alice.user_id, "s1"),
            ToolAccess::Unrestricted
        );
    }

    #[test]
    fn grants_elsewhere_restrict_this_server_to_nothing() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        engine.add_tool_grant(ToolGrant {
            role_id: "ops".into(),
            server_id: "s2".into(),
            tool_name: "mul".into(),
        });
        assert_eq!(
            engine.allowed_tools(&alice.user_id, "s1"),
            ToolAccess::Restricted(BTreeSet::new())
        );
    }

    #[test]
    fn grants_on_server_form_exact_allow_list() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        for tool in ["sum", "mul"] {
            engine.add_tool_grant(ToolGrant {
                role_id: "ops".into(),
                server_id: "s1".into(),
                tool_name: tool.into(),
            });
        }
        assert_eq!(
            engine.allowed_tools(&alice.user_id, "s1"),
            ToolAccess::Restricted(BTreeSet::from(["sum".to_string(), "mul".to_string()]))
        );
    }

    #[test]
    fn delete_role_revokes_access() {
        let (_dir, engine) = engine();
        let alice = ops_user(&engine);
        engine.add_tool_grant(ToolGrant {
            role_id: "ops".into(),
            server_id: "s1".into(),
            tool_name: "sum".into(),
        });
        assert!(engine.can_execute_tool(&alice.user_id, "s1", "sum"));

        engine.delete_role("ops").unwrap();
        assert!(!engine.can_execute_tool(&alice.user_id, "s1", "sum"));
        assert!(!engine.has_permission(&alice.user_id, Permission::ToolExecute));
    }

    #[test]
    fn authenticate_local_rejects_bad_password() {
        let (_dir, engine) = engine();
        ops_user(&engine);
        assert!(engine.authenticate_local("alice@example.com", "pw").is_some());
        assert!(engine.authenticate_local("alice@example.com", "nope").is_none());
        assert!(engine.authenticate_local("ghost@example.com", "pw").is_none());
    }

    #[test]
    fn get_or_create_is_idempotent_by_email() {
        let (_dir, engine) = engine();
        let first = engine
            .get_or_create_user("Dana@Example.com", None, "corp-oidc")
            .unwrap();
        let second = engine
            .get_or_create_user("dana@example.com", None, "corp-oidc")
            .unwrap();
        assert_eq!(first.user_id, second.user_id);
    }

    #[test]
    fn slugify_matches_legacy_rules() {
        assert_eq!(slugify("Tool Manager"), "tool_manager");
        assert_eq!(slugify("SRE-Team"), "sre_team");
        assert_eq!(slugify("Ops!@#"), "ops");
        assert_eq!(slugify("日本語"), "");
    }
}

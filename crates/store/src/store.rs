//! JSON-file-backed implementation of the store adapter.
//!
//! All state lives in `gateway.json` under the configured state path. Reads
//! take the shared lock, mutations the exclusive lock plus a dirty flag; a
//! background task calls [`GatewayStore::flush`] periodically and at
//! shutdown.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::{
    BackendServer, GroupMapping, OAuthProviderRecord, RoleRecord, ToolGrant,
    ToolOAuthAssociation, UserRecord,
};

/// Errors surfaced by the store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("email already registered: {0}")]
    EmailTaken(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("role not found: {0}")]
    RoleNotFound(String),

    #[error("cannot modify system role: {0}")]
    SystemRole(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for tg_domain::error::Error {
    fn from(e: StoreError) -> Self {
        tg_domain::error::Error::Store(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// On-disk document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    users: HashMap<String, UserRecord>,
    #[serde(default)]
    roles: HashMap<String, RoleRecord>,
    #[serde(default)]
    grants: Vec<ToolGrant>,
    #[serde(default)]
    servers: HashMap<String, BackendServer>,
    #[serde(default)]
    oauth_providers: HashMap<String, OAuthProviderRecord>,
    #[serde(default)]
    group_mappings: Vec<GroupMapping>,
    #[serde(default)]
    tool_oauth: Vec<ToolOAuthAssociation>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GatewayStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The gateway's durable store. See the crate docs for the contract.
pub struct GatewayStore {
    path: PathBuf,
    data: RwLock<StoreData>,
    dirty: AtomicBool,
}

impl GatewayStore {
    /// Load or create the store at `state_path/gateway.json`.
    pub fn open(state_path: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(state_path)?;
        let path = state_path.join("gateway.json");

        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            StoreData::default()
        };

        tracing::info!(
            users = data.users.len(),
            roles = data.roles.len(),
            servers = data.servers.len(),
            path = %path.display(),
            "gateway store loaded"
        );

        Ok(Self {
            path,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Persist to disk if anything changed since the last flush.
    pub fn flush(&self) -> StoreResult<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let json = {
            let data = self.data.read();
            serde_json::to_string_pretty(&*data)?
        };
        // Write via temp file + rename so a crash mid-write cannot truncate
        // the document.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), "gateway store flushed");
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Insert or replace a user. Enforces case-insensitive email uniqueness.
    pub fn save_user(&self, user: UserRecord) -> StoreResult<()> {
        let mut data = self.data.write();
        let email_lc = user.email.to_lowercase();
        let taken = data
            .users
            .values()
            .any(|u| u.user_id != user.user_id && u.email.to_lowercase() == email_lc);
        if taken {
            return Err(StoreError::EmailTaken(user.email));
        }
        data.users.insert(user.user_id.clone(), user);
        drop(data);
        self.mark_dirty();
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Option<UserRecord> {
        self.data.read().users.get(user_id).cloned()
    }

    /// Email lookup is case-insensitive.
    pub fn get_user_by_email(&self, email: &str) -> Option<UserRecord> {
        let email_lc = email.to_lowercase();
        self.data
            .read()
            .users
            .values()
            .find(|u| u.email.to_lowercase() == email_lc)
            .cloned()
    }

    /// Delete a user. Role assignments live inline on the record, so no
    /// cascade is needed beyond the removal itself.
    pub fn delete_user(&self, user_id: &str) -> bool {
        let removed = self.data.write().users.remove(user_id).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn list_users(&self) -> Vec<UserRecord> {
        self.data.read().users.values().cloned().collect()
    }

    pub fn set_user_enabled(&self, user_id: &str, enabled: bool) -> StoreResult<()> {
        let mut data = self.data.write();
        let user = data
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.into()))?;
        user.enabled = enabled;
        drop(data);
        self.mark_dirty();
        Ok(())
    }

    pub fn set_password_hash(&self, user_id: &str, password_hash: String) -> StoreResult<()> {
        let mut data = self.data.write();
        let user = data
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.into()))?;
        user.password_hash = Some(password_hash);
        drop(data);
        self.mark_dirty();
        Ok(())
    }

    pub fn update_last_login(&self, user_id: &str) {
        let mut data = self.data.write();
        if let Some(user) = data.users.get_mut(user_id) {
            user.last_login = Some(Utc::now());
            drop(data);
            self.mark_dirty();
        }
    }

    /// Assign a role. The role must exist; assigning twice is a no-op.
    pub fn assign_role(&self, user_id: &str, role_id: &str) -> StoreResult<bool> {
        let mut data = self.data.write();
        if !data.roles.contains_key(role_id) {
            return Err(StoreError::RoleNotFound(role_id.into()));
        }
        let user = data
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.into()))?;
        let inserted = user.roles.insert(role_id.into());
        drop(data);
        if inserted {
            self.mark_dirty();
        }
        Ok(inserted)
    }

    pub fn revoke_role(&self, user_id: &str, role_id: &str) -> bool {
        let mut data = self.data.write();
        let removed = data
            .users
            .get_mut(user_id)
            .map(|u| u.roles.remove(role_id))
            .unwrap_or(false);
        drop(data);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn clear_user_roles(&self, user_id: &str) {
        let mut data = self.data.write();
        if let Some(user) = data.users.get_mut(user_id) {
            if !user.roles.is_empty() {
                user.roles.clear();
                drop(data);
                self.mark_dirty();
            }
        }
    }

    /// Bulk query: ids of every user carrying `role_id`.
    pub fn users_with_role(&self, role_id: &str) -> Vec<String> {
        self.data
            .read()
            .users
            .values()
            .filter(|u| u.roles.contains(role_id))
            .map(|u| u.user_id.clone())
            .collect()
    }

    // ── Roles ────────────────────────────────────────────────────────

    pub fn save_role(&self, role: RoleRecord) -> StoreResult<()> {
        let mut data = self.data.write();
        data.roles.insert(role.role_id.clone(), role);
        drop(data);
        self.mark_dirty();
        Ok(())
    }

    pub fn get_role(&self, role_id: &str) -> Option<RoleRecord> {
        self.data.read().roles.get(role_id).cloned()
    }

    /// Delete a role. System roles are refused. Deletion cascades to user
    /// role sets, tool grants, and group mappings.
    pub fn delete_role(&self, role_id: &str) -> StoreResult<bool> {
        let mut data = self.data.write();
        match data.roles.get(role_id) {
            None => return Ok(false),
            Some(role) if role.is_system => {
                return Err(StoreError::SystemRole(role_id.into()));
            }
            Some(_) => {}
        }
        data.roles.remove(role_id);
        for user in data.users.values_mut() {
            user.roles.remove(role_id);
        }
        data.grants.retain(|g| g.role_id != role_id);
        data.group_mappings.retain(|m| m.role_id != role_id);
        drop(data);
        self.mark_dirty();
        Ok(true)
    }

    pub fn list_roles(&self) -> Vec<RoleRecord> {
        self.data.read().roles.values().cloned().collect()
    }

    // ── Role-tool grants ─────────────────────────────────────────────

    /// Add a grant; returns false if it already existed.
    pub fn add_grant(&self, grant: ToolGrant) -> bool {
        let mut data = self.data.write();
        if data.grants.contains(&grant) {
            return false;
        }
        data.grants.push(grant);
        drop(data);
        self.mark_dirty();
        true
    }

    pub fn remove_grant(&self, grant: &ToolGrant) -> bool {
        let mut data = self.data.write();
        let before = data.grants.len();
        data.grants.retain(|g| g != grant);
        let removed = data.grants.len() != before;
        drop(data);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Replace every grant of `role_id` with the given set.
    pub fn set_role_grants(&self, role_id: &str, grants: Vec<ToolGrant>) {
        let mut data = self.data.write();
        data.grants.retain(|g| g.role_id != role_id);
        data.grants
            .extend(grants.into_iter().filter(|g| g.role_id == role_id));
        drop(data);
        self.mark_dirty();
    }

    /// Bulk query: all grants of one role, across all servers.
    pub fn grants_for_role(&self, role_id: &str) -> Vec<ToolGrant> {
        self.data
            .read()
            .grants
            .iter()
            .filter(|g| g.role_id == role_id)
            .cloned()
            .collect()
    }

    /// Tool names a role is granted on one server.
    pub fn role_tools_on_server(&self, role_id: &str, server_id: &str) -> BTreeSet<String> {
        self.data
            .read()
            .grants
            .iter()
            .filter(|g| g.role_id == role_id && g.server_id == server_id)
            .map(|g| g.tool_name.clone())
            .collect()
    }

    pub fn all_grants(&self) -> Vec<ToolGrant> {
        self.data.read().grants.clone()
    }

    // ── Backend servers ──────────────────────────────────────────────

    pub fn save_server(&self, server: BackendServer) {
        let mut data = self.data.write();
        data.servers.insert(server.server_id.clone(), server);
        drop(data);
        self.mark_dirty();
    }

    pub fn get_server(&self, server_id: &str) -> Option<BackendServer> {
        self.data.read().servers.get(server_id).cloned()
    }

    pub fn server_by_url(&self, url: &str) -> Option<BackendServer> {
        self.data
            .read()
            .servers
            .values()
            .find(|s| s.url == url)
            .cloned()
    }

    /// Delete a server and its grants and tool associations.
    pub fn delete_server(&self, server_id: &str) -> bool {
        let mut data = self.data.write();
        let removed = data.servers.remove(server_id).is_some();
        if removed {
            data.grants.retain(|g| g.server_id != server_id);
            data.tool_oauth.retain(|a| a.server_id != server_id);
        }
        drop(data);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn list_servers(&self) -> Vec<BackendServer> {
        self.data.read().servers.values().cloned().collect()
    }

    // ── OAuth providers ──────────────────────────────────────────────

    pub fn save_oauth_provider(&self, provider: OAuthProviderRecord) {
        let mut data = self.data.write();
        data.oauth_providers
            .insert(provider.provider_id.clone(), provider);
        drop(data);
        self.mark_dirty();
    }

    pub fn get_oauth_provider(&self, provider_id: &str) -> Option<OAuthProviderRecord> {
        self.data.read().oauth_providers.get(provider_id).cloned()
    }

    /// Delete a provider and its group mappings and tool associations.
    pub fn delete_oauth_provider(&self, provider_id: &str) -> bool {
        let mut data = self.data.write();
        let removed = data.oauth_providers.remove(provider_id).is_some();
        if removed {
            data.group_mappings.retain(|m| m.provider_id != provider_id);
            data.tool_oauth.retain(|a| a.provider_id != provider_id);
        }
        drop(data);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn list_oauth_providers(&self) -> Vec<OAuthProviderRecord> {
        self.data.read().oauth_providers.values().cloned().collect()
    }

    // ── Group → role mappings ────────────────────────────────────────

    pub fn add_group_mapping(&self, mapping: GroupMapping) -> bool {
        let mut data = self.data.write();
        if data.group_mappings.contains(&mapping) {
            return false;
        }
        data.group_mappings.push(mapping);
        drop(data);
        self.mark_dirty();
        true
    }

    pub fn remove_group_mapping(&self, mapping: &GroupMapping) -> bool {
        let mut data = self.data.write();
        let before = data.group_mappings.len();
        data.group_mappings.retain(|m| m != mapping);
        let removed = data.group_mappings.len() != before;
        drop(data);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn list_group_mappings(&self, provider_id: Option<&str>) -> Vec<GroupMapping> {
        self.data
            .read()
            .group_mappings
            .iter()
            .filter(|m| provider_id.map_or(true, |p| m.provider_id == p))
            .cloned()
            .collect()
    }

    /// Bulk query: role ids mapped to any of `groups` for one provider.
    pub fn roles_for_groups(&self, provider_id: &str, groups: &[String]) -> BTreeSet<String> {
        self.data
            .read()
            .group_mappings
            .iter()
            .filter(|m| m.provider_id == provider_id && groups.contains(&m.group_name))
            .map(|m| m.role_id.clone())
            .collect()
    }

    // ── Tool ↔ OAuth associations ────────────────────────────────────

    pub fn add_tool_oauth(&self, assoc: ToolOAuthAssociation) -> bool {
        let mut data = self.data.write();
        if data.tool_oauth.contains(&assoc) {
            return false;
        }
        data.tool_oauth.push(assoc);
        drop(data);
        self.mark_dirty();
        true
    }

    pub fn remove_tool_oauth(&self, assoc: &ToolOAuthAssociation) -> bool {
        let mut data = self.data.write();
        let before = data.tool_oauth.len();
        data.tool_oauth.retain(|a| a != assoc);
        let removed = data.tool_oauth.len() != before;
        drop(data);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn list_tool_oauth(&self) -> Vec<ToolOAuthAssociation> {
        self.data.read().tool_oauth.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

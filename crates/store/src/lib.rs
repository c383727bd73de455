//! `tg-store` — the gateway's persistent store adapter.
//!
//! Every durable entity (users, roles, role/tool grants, backend servers,
//! OAuth providers, group→role mappings, tool↔OAuth associations) lives
//! behind [`GatewayStore`]. The API is synchronous CRUD plus the handful of
//! targeted bulk queries the RBAC engine and discovery service need; no
//! business logic lives here.
//!
//! The backing engine is a single JSON document under the state directory,
//! guarded by a `parking_lot::RwLock` with a dirty-flag flush. Swapping
//! engines means reimplementing this crate behind the same API.

pub mod model;
pub mod store;

pub use model::{
    BackendServer, GroupMapping, OAuthProviderRecord, RoleRecord, ToolGrant,
    ToolOAuthAssociation, UserRecord,
};
pub use store::{GatewayStore, StoreError, StoreResult};

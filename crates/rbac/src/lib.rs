//! `tg-rbac` — authorization for the ToolGate gateway.
//!
//! Three pieces:
//! - [`Permission`] — the closed set of permission tokens.
//! - [`PermissionCache`] — TTL + LRU cache of resolved per-user permission
//!   snapshots with targeted invalidation.
//! - [`RbacEngine`] — deny-by-default decisions over users, roles, and
//!   per-tool role grants, with read-through cache population and the
//!   invalidation hooks every mutation must run.

pub mod cache;
pub mod engine;
pub mod permission;

pub use cache::{CacheStats, PermissionCache, PermissionSnapshot};
pub use engine::{RbacEngine, ToolAccess};
pub use permission::Permission;

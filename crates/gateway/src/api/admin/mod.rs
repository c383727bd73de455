//! Admin API: CRUD over users, roles, grants, backend servers, OAuth
//! providers, and group→role mappings.
//!
//! Every handler authenticates via the [`Principal`] extractor and
//! authorizes against a specific permission; admins pass everything.
//!
//! [`Principal`]: crate::api::principal::Principal

pub mod oauth;
pub mod roles;
pub mod servers;
pub mod users;

//! `tg-gateway` — the ToolGate gateway binary.
//!
//! Wires the store, RBAC engine, auth surface, connection manager, health
//! monitor, and discovery service into one axum application exposing:
//! - the unified MCP endpoint (`POST /mcp`)
//! - the auth surface (`/auth/*`)
//! - the admin API (`/admin/*`)

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod runtime;
pub mod state;

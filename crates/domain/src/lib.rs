//! `tg-domain` — shared types for the ToolGate gateway.
//!
//! Holds the configuration model (deserialized from TOML) and the shared
//! error type used across all ToolGate crates. No I/O happens here.

pub mod config;
pub mod error;

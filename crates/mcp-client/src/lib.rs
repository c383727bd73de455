//! `tg-mcp-client` — backend connection manager for the ToolGate gateway.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for the MCP dialect the gateway speaks.
//! - An HTTP-POST transport with cached `Mcp-Session-Id` sessions,
//!   single-flight session acquisition, and one retry after session loss.
//! - An SSE transport: one long-lived reader task per backend, endpoint
//!   discovery from the first `event: endpoint` frame, response correlation
//!   by request id, and bounded reconnection.
//! - A [`ConnectionManager`] that picks the transport from the backend URL
//!   (`/sse` suffix = SSE, anything else = HTTP POST) and surfaces one
//!   uniform [`ToolBackend`] contract to discovery, health, and the router.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tg_mcp_client::{ConnectionManager, ToolBackend};
//!
//! let manager = ConnectionManager::new(&config.backends)?;
//! let tools = manager.list_tools("http://localhost:8001/mcp").await?;
//! let result = manager
//!     .call_tool("http://localhost:8001/mcp", "sum", json!({"a": 1, "b": 2}))
//!     .await?;
//! ```

pub mod http;
pub mod manager;
pub mod protocol;
pub mod sse;

// Re-exports for convenience.
pub use manager::{ConnectionManager, McpClientError, ToolBackend};
pub use protocol::{JsonRpcError, ToolDef};

use std::sync::Arc;

use tg_auth::{LoginService, TokenIssuer};
use tg_domain::config::Config;
use tg_mcp_client::ToolBackend;
use tg_rbac::RbacEngine;
use tg_store::GatewayStore;

use crate::runtime::discovery::DiscoveryService;
use crate::runtime::health::HealthMonitor;

/// Shared application state passed to all API handlers.
///
/// Everything here is a process-wide singleton built once at startup and
/// injected into handlers; nothing reaches for globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Persistence & authorization ──────────────────────────────────
    pub store: Arc<GatewayStore>,
    pub rbac: Arc<RbacEngine>,

    // ── Auth surface ─────────────────────────────────────────────────
    pub tokens: Arc<TokenIssuer>,
    pub login: Arc<LoginService>,

    // ── Backends ─────────────────────────────────────────────────────
    /// Connection manager behind the mockable [`ToolBackend`] seam.
    pub backend: Arc<dyn ToolBackend>,
    pub health: Arc<HealthMonitor>,
    pub discovery: Arc<DiscoveryService>,
}

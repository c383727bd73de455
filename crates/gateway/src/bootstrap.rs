//! AppState construction and background-task spawning.
//!
//! Everything process-wide (store, caches, engines, connection manager,
//! health monitor, discovery service) is built here once and injected into
//! handlers via [`AppState`]; nothing reaches for globals.

use std::sync::Arc;

use anyhow::Context;

use tg_auth::{LoginService, OAuthRegistry, TokenIssuer};
use tg_domain::config::{Config, ConfigSeverity};
use tg_mcp_client::{ConnectionManager, ToolBackend};
use tg_rbac::{PermissionCache, RbacEngine};
use tg_store::GatewayStore;

use crate::runtime::discovery::DiscoveryService;
use crate::runtime::health::HealthMonitor;
use crate::state::AppState;

/// Validate config, initialize every subsystem, and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Store ────────────────────────────────────────────────────────
    let store = Arc::new(
        GatewayStore::open(&config.state.path).context("opening gateway store")?,
    );

    // ── RBAC engine + permission cache ───────────────────────────────
    let cache = PermissionCache::from_config(&config.permission_cache);
    let rbac = Arc::new(RbacEngine::new(store.clone(), cache));
    rbac.ensure_defaults().context("seeding default roles")?;
    tracing::info!("RBAC engine ready");

    // ── Token issuer ─────────────────────────────────────────────────
    let secret = match std::env::var(&config.auth.token_secret_env) {
        Ok(secret) if !secret.is_empty() => {
            tracing::info!(env_var = %config.auth.token_secret_env, "token signing secret loaded");
            secret.into_bytes()
        }
        _ => {
            tracing::warn!(
                env_var = %config.auth.token_secret_env,
                "no token secret configured — using a random per-process secret; \
                 issued tokens will not survive a restart"
            );
            let mut secret = uuid::Uuid::new_v4().as_bytes().to_vec();
            secret.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
            secret
        }
    };
    let tokens = Arc::new(TokenIssuer::new(secret, config.auth.token_ttl_secs));

    // ── OAuth registry + login pipeline ──────────────────────────────
    let oauth = Arc::new(OAuthRegistry::new(store.clone()));
    let login = Arc::new(LoginService::new(
        store.clone(),
        rbac.clone(),
        tokens.clone(),
        oauth,
        &config.auth,
    ));
    tracing::info!(policy = ?config.auth.no_role_policy, "login pipeline ready");

    // ── Connection manager ───────────────────────────────────────────
    let backend: Arc<dyn ToolBackend> = Arc::new(
        ConnectionManager::new(&config.backends).context("building connection manager")?,
    );
    tracing::info!("connection manager ready");

    // ── Health monitor + discovery service ───────────────────────────
    let health = Arc::new(HealthMonitor::new(&config.health));
    let discovery = Arc::new(DiscoveryService::new(
        store.clone(),
        backend.clone(),
        health.clone(),
    ));
    tracing::info!(
        check_interval_secs = config.health.check_interval_secs,
        stale_timeout_secs = config.health.stale_timeout_secs,
        "health monitor + discovery service ready"
    );

    Ok(AppState {
        config,
        store,
        rbac,
        tokens,
        login,
        backend,
        health,
        discovery,
    })
}

/// Spawn the long-running background tasks: the initial discovery refresh,
/// the health loop, and the periodic store flush.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Initial tool discovery ───────────────────────────────────────
    {
        let discovery = state.discovery.clone();
        tokio::spawn(async move {
            discovery.refresh().await;
        });
    }

    // ── Health loop ──────────────────────────────────────────────────
    if state.config.health.enabled {
        let discovery = state.discovery.clone();
        let interval_secs = state.config.health.check_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            // The first tick fires immediately; skip it so boot isn't
            // racing the initial discovery refresh.
            interval.tick().await;
            loop {
                interval.tick().await;
                discovery.health_pass().await;
            }
        });
    } else {
        tracing::info!("health monitoring disabled by config");
    }

    // ── Periodic store flush ─────────────────────────────────────────
    {
        let store = state.store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = store.flush() {
                    tracing::warn!(error = %e, "gateway store flush failed");
                }
            }
        });
    }

    tracing::info!("background tasks spawned");
}

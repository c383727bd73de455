//! Per-backend health state and the circuit breaker.
//!
//! Each backend URL carries a [`ServerHealth`] record. Three consecutive
//! failures mark it unhealthy; any success resets the counter. Two
//! functions drive every skip decision: [`HealthMonitor::should_skip`]
//! (unhealthy, or failed within the last 30 seconds) and
//! [`HealthMonitor::adaptive_timeout`] (5 s for degraded backends instead
//! of the configured default). They are the only mechanism keeping a dead
//! backend from dragging down discovery and aggregation latency.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use tg_domain::config::HealthConfig;

/// Failures before a backend is marked unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Backends that failed within this window are skipped even while still
/// nominally healthy, to avoid rapid retry of a backend that just failed.
pub const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// Timeout applied to backends with recent failures.
pub const DEGRADED_TIMEOUT: Duration = Duration::from_secs(5);

/// Health record for one backend URL.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub server_url: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub is_healthy: bool,
    pub last_error: Option<String>,
}

impl ServerHealth {
    fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            last_success: None,
            last_check: None,
            consecutive_failures: 0,
            is_healthy: true,
            last_error: None,
        }
    }

    fn mark_success(&mut self) {
        let now = Utc::now();
        self.last_success = Some(now);
        self.last_check = Some(now);
        self.consecutive_failures = 0;
        self.is_healthy = true;
        self.last_error = None;
    }

    fn mark_failure(&mut self, error: &str) {
        self.last_check = Some(Utc::now());
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        if self.consecutive_failures >= UNHEALTHY_THRESHOLD {
            self.is_healthy = false;
            tracing::warn!(
                url = %self.server_url,
                failures = self.consecutive_failures,
                error,
                "backend marked unhealthy"
            );
        }
    }

    /// No success within `timeout` (or ever) counts as stale.
    fn is_stale(&self, timeout: Duration) -> bool {
        match self.last_success {
            None => true,
            Some(last) => {
                let age = Utc::now().signed_duration_since(last);
                age.num_seconds() >= 0 && age.num_seconds() as u64 > timeout.as_secs()
            }
        }
    }
}

/// Tracks health for every registered backend. Mutations come from the
/// health loop and the discovery fan-out; readers take snapshots.
pub struct HealthMonitor {
    cfg: HealthConfig,
    entries: Mutex<HashMap<String, ServerHealth>>,
}

impl HealthMonitor {
    pub fn new(cfg: &HealthConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create the record on first sight of a backend.
    pub fn ensure_entry(&self, url: &str) {
        self.entries
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| ServerHealth::new(url));
    }

    pub fn mark_success(&self, url: &str) {
        self.entries
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| ServerHealth::new(url))
            .mark_success();
    }

    pub fn mark_failure(&self, url: &str, error: &str) {
        self.entries
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| ServerHealth::new(url))
            .mark_failure(error);
    }

    /// Circuit breaker: skip a backend that is unhealthy, or that failed
    /// within the last [`RECENT_FAILURE_WINDOW`]. Backends with no health
    /// record yet are always attempted.
    pub fn should_skip(&self, url: &str) -> bool {
        let entries = self.entries.lock();
        let Some(health) = entries.get(url) else {
            return false;
        };

        if !health.is_healthy {
            tracing::debug!(
                url,
                failures = health.consecutive_failures,
                "skipping unhealthy backend"
            );
            return true;
        }

        if health.consecutive_failures > 0 {
            if let Some(last_check) = health.last_check {
                let since = Utc::now().signed_duration_since(last_check);
                if since.num_seconds() >= 0
                    && (since.num_seconds() as u64) < RECENT_FAILURE_WINDOW.as_secs()
                {
                    tracing::debug!(url, "skipping recently failed backend");
                    return true;
                }
            }
        }

        false
    }

    /// Full timeout for healthy backends, [`DEGRADED_TIMEOUT`] for ones
    /// with recent failures.
    pub fn adaptive_timeout(&self, url: &str) -> Duration {
        let default = Duration::from_secs(self.cfg.discovery_timeout_secs);
        let entries = self.entries.lock();
        match entries.get(url) {
            Some(health) if health.consecutive_failures > 0 => DEGRADED_TIMEOUT,
            _ => default,
        }
    }

    /// Whether an HTTP backend needs a staleness probe.
    pub fn is_stale(&self, url: &str) -> bool {
        let stale_timeout = Duration::from_secs(self.cfg.stale_timeout_secs);
        let entries = self.entries.lock();
        entries
            .get(url)
            .map(|h| h.is_stale(stale_timeout))
            .unwrap_or(true)
    }

    /// Snapshot one backend's health, if tracked.
    pub fn snapshot(&self, url: &str) -> Option<ServerHealth> {
        self.entries.lock().get(url).cloned()
    }

    /// Snapshot every tracked backend.
    pub fn snapshot_all(&self) -> Vec<ServerHealth> {
        self.entries.lock().values().cloned().collect()
    }

    /// Drop records for backends no longer registered.
    pub fn prune_missing(&self, valid_urls: &HashSet<String>) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|url, _| valid_urls.contains(url));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(removed, "pruned health records for removed backends");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(&HealthConfig::default())
    }

    #[test]
    fn three_failures_mark_unhealthy() {
        let m = monitor();
        for _ in 0..2 {
            m.mark_failure("http://h/mcp", "boom");
        }
        assert!(m.snapshot("http://h/mcp").unwrap().is_healthy);
        m.mark_failure("http://h/mcp", "boom");
        let health = m.snapshot("http://h/mcp").unwrap();
        assert!(!health.is_healthy);
        assert_eq!(health.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_failures() {
        let m = monitor();
        for _ in 0..3 {
            m.mark_failure("http://h/mcp", "boom");
        }
        m.mark_success("http://h/mcp");
        let health = m.snapshot("http://h/mcp").unwrap();
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.is_none());
    }

    #[test]
    fn unknown_backend_is_not_skipped() {
        let m = monitor();
        assert!(!m.should_skip("http://new/mcp"));
    }

    #[test]
    fn unhealthy_backend_is_skipped() {
        let m = monitor();
        for _ in 0..3 {
            m.mark_failure("http://h/mcp", "boom");
        }
        assert!(m.should_skip("http://h/mcp"));
    }

    #[test]
    fn single_recent_failure_skips_within_window() {
        let m = monitor();
        m.mark_failure("http://h/mcp", "boom");
        // Still healthy, but failed moments ago.
        assert!(m.snapshot("http://h/mcp").unwrap().is_healthy);
        assert!(m.should_skip("http://h/mcp"));
    }

    #[test]
    fn degraded_backend_gets_short_timeout() {
        let m = monitor();
        let default = Duration::from_secs(HealthConfig::default().discovery_timeout_secs);
        assert_eq!(m.adaptive_timeout("http://h/mcp"), default);
        m.mark_failure("http://h/mcp", "boom");
        assert_eq!(m.adaptive_timeout("http://h/mcp"), DEGRADED_TIMEOUT);
        m.mark_success("http://h/mcp");
        assert_eq!(m.adaptive_timeout("http://h/mcp"), default);
    }

    #[test]
    fn never_succeeded_counts_as_stale() {
        let m = monitor();
        m.ensure_entry("http://h/mcp");
        assert!(m.is_stale("http://h/mcp"));
        m.mark_success("http://h/mcp");
        assert!(!m.is_stale("http://h/mcp"));
    }

    #[test]
    fn prune_drops_unregistered() {
        let m = monitor();
        m.ensure_entry("http://a/mcp");
        m.ensure_entry("http://b/mcp");
        m.prune_missing(&HashSet::from(["http://a/mcp".to_string()]));
        assert!(m.snapshot("http://a/mcp").is_some());
        assert!(m.snapshot("http://b/mcp").is_none());
    }
}

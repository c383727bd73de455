use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend connections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Per-call timeout for `tools/call` forwarded to a backend.
    #[serde(default = "d_call_timeout")]
    pub call_timeout_secs: u64,
    /// Connect timeout for new backend connections (both transports).
    #[serde(default = "d_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Fixed delay between SSE reconnect attempts.
    #[serde(default = "d_reconnect_delay")]
    pub sse_reconnect_delay_secs: u64,
    /// Reconnect attempts before an SSE backend is given up on.
    #[serde(default = "d_reconnect_attempts")]
    pub sse_max_reconnect_attempts: u32,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: d_call_timeout(),
            connect_timeout_secs: d_connect_timeout(),
            sse_reconnect_delay_secs: d_reconnect_delay(),
            sse_max_reconnect_attempts: d_reconnect_attempts(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health monitoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Master switch for the background health loop.
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Seconds between health-check passes.
    #[serde(default = "d_check_interval")]
    pub check_interval_secs: u64,
    /// An HTTP backend with no success for this long gets probed.
    #[serde(default = "d_stale_timeout")]
    pub stale_timeout_secs: u64,
    /// Default timeout for discovery fan-out fetches. Degraded backends
    /// get a much shorter adaptive timeout instead.
    #[serde(default = "d_fetch_timeout")]
    pub discovery_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: d_check_interval(),
            stale_timeout_secs: d_stale_timeout(),
            discovery_timeout_secs: d_fetch_timeout(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_call_timeout() -> u64 {
    30
}
fn d_connect_timeout() -> u64 {
    10
}
fn d_reconnect_delay() -> u64 {
    2
}
fn d_reconnect_attempts() -> u32 {
    3
}
fn d_check_interval() -> u64 {
    30
}
fn d_stale_timeout() -> u64 {
    120
}
fn d_fetch_timeout() -> u64 {
    60
}

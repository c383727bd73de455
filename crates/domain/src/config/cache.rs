use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionCacheConfig {
    /// Entry lifetime. Mutations invalidate eagerly; the TTL is the
    /// fallback expiry.
    #[serde(default = "d_ttl")]
    pub ttl_secs: u64,
    /// Hard cap on cached users; least-recently-accessed entries are
    /// evicted beyond this.
    #[serde(default = "d_max_entries")]
    pub max_entries: usize,
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: d_ttl(),
            max_entries: d_max_entries(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_ttl() -> u64 {
    300
}
fn d_max_entries() -> usize {
    50_000
}

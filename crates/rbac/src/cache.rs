//! Permission cache with TTL and LRU eviction.
//!
//! In-memory map of `user_id → resolved permission snapshot`. Mutations to
//! users, roles, or grants invalidate entries eagerly; the TTL is the
//! fallback expiry. A hard entry cap evicts the least-recently-accessed
//! snapshot. One mutex covers the map and the hit/miss counters; callers
//! never hold other locks across cache calls.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use tg_domain::config::PermissionCacheConfig;

/// A user's resolved permissions, as cached.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionSnapshot {
    pub enabled: bool,
    pub roles: Vec<String>,
    pub is_admin: bool,
    pub permissions: BTreeSet<String>,
    pub has_tool_execute: bool,
    pub has_tool_manage: bool,
    pub email: String,
}

struct Entry {
    snapshot: PermissionSnapshot,
    created_at: Instant,
    accessed_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Entry>,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub invalidations: u64,
}

/// Thread-safe permission cache with TTL and LRU eviction.
pub struct PermissionCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

impl PermissionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        tracing::info!(
            ttl_secs = ttl.as_secs(),
            max_entries,
            "permission cache initialized"
        );
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            max_entries,
        }
    }

    pub fn from_config(cfg: &PermissionCacheConfig) -> Self {
        Self::new(Duration::from_secs(cfg.ttl_secs), cfg.max_entries)
    }

    /// Get the cached snapshot. `None` if absent or older than the TTL;
    /// a hit refreshes the access time for LRU.
    pub fn get(&self, user_id: &str) -> Option<PermissionSnapshot> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(user_id) else {
            inner.misses += 1;
            return None;
        };

        if entry.created_at.elapsed() > self.ttl {
            inner.entries.remove(user_id);
            inner.misses += 1;
            return None;
        }

        entry.accessed_at = Instant::now();
        let snapshot = entry.snapshot.clone();
        inner.hits += 1;
        Some(snapshot)
    }

    /// Insert a snapshot. If the cache is at capacity and the key is new,
    /// the least-recently-accessed entry is evicted first.
    pub fn set(&self, user_id: &str, snapshot: PermissionSnapshot) {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(user_id) {
            if let Some(lru) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.accessed_at)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru);
                tracing::debug!(evicted = %lru, "permission cache evicted LRU entry");
            }
        }

        let now = Instant::now();
        inner.entries.insert(
            user_id.to_string(),
            Entry {
                snapshot,
                created_at: now,
                accessed_at: now,
            },
        );
    }

    /// Invalidate one user's entry.
    pub fn invalidate_user(&self, user_id: &str) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(user_id).is_some() {
            inner.invalidations += 1;
        }
    }

    /// Invalidate a batch of users.
    pub fn invalidate_users(&self, user_ids: &[String]) {
        let mut inner = self.inner.lock();
        for user_id in user_ids {
            if inner.entries.remove(user_id).is_some() {
                inner.invalidations += 1;
            }
        }
    }

    /// Invalidate every user carrying a role. The resolver enumerates the
    /// carriers; if it fails, the scope widens to the whole cache rather
    /// than risking a stale grant.
    pub fn invalidate_by_role<E: std::fmt::Display>(
        &self,
        role_id: &str,
        resolver: impl FnOnce(&str) -> Result<Vec<String>, E>,
    ) {
        match resolver(role_id) {
            Ok(user_ids) => {
                tracing::info!(
                    role_id,
                    users = user_ids.len(),
                    "cache invalidated for role"
                );
                self.invalidate_users(&user_ids);
            }
            Err(e) => {
                tracing::warn!(
                    role_id,
                    error = %e,
                    "failed to resolve users for role, invalidating entire cache"
                );
                self.invalidate_all();
            }
        }
    }

    /// Clear the entire cache.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries.len() as u64;
        inner.entries.clear();
        inner.invalidations += count;
        tracing::info!(cleared = count, "permission cache invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            entries: inner.entries.len(),
            max_entries: self.max_entries,
            ttl_seconds: self.ttl.as_secs(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                (inner.hits as f64 / total as f64 * 10_000.0).round() / 100.0
            },
            invalidations: inner.invalidations,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(email: &str) -> PermissionSnapshot {
        PermissionSnapshot {
            enabled: true,
            roles: vec!["ops".into()],
            is_admin: false,
            permissions: BTreeSet::from(["tool:execute".to_string()]),
            has_tool_execute: true,
            has_tool_manage: false,
            email: email.into(),
        }
    }

    #[test]
    fn set_then_get_within_ttl() {
        let cache = PermissionCache::new(Duration::from_secs(300), 10);
        cache.set("u1", snapshot("a@x.com"));
        let got = cache.get("u1").unwrap();
        assert_eq!(got.email, "a@x.com");
        assert!(got.has_tool_execute);
    }

    #[test]
    fn expired_entry_misses() {
        let cache = PermissionCache::new(Duration::from_millis(10), 10);
        cache.set("u1", snapshot("a@x.com"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("u1").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn lru_evicts_oldest_accessed() {
        let cache = PermissionCache::new(Duration::from_secs(300), 2);
        cache.set("u1", snapshot("u1@x.com"));
        std::thread::sleep(Duration::from_millis(5));
        cache.set("u2", snapshot("u2@x.com"));
        std::thread::sleep(Duration::from_millis(5));

        // Touch u1 so u2 becomes the LRU entry.
        cache.get("u1").unwrap();
        std::thread::sleep(Duration::from_millis(5));

        cache.set("u3", snapshot("u3@x.com"));
        assert!(cache.get("u1").is_some());
        assert!(cache.get("u2").is_none());
        assert!(cache.get("u3").is_some());
    }

    #[test]
    fn overwriting_existing_key_never_evicts() {
        let cache = PermissionCache::new(Duration::from_secs(300), 2);
        cache.set("u1", snapshot("u1@x.com"));
        cache.set("u2", snapshot("u2@x.com"));
        cache.set("u1", snapshot("u1-new@x.com"));
        assert_eq!(cache.get("u1").unwrap().email, "u1-new@x.com");
        assert!(cache.get("u2").is_some());
    }

    #[test]
    fn invalidate_user_counts() {
        let cache = PermissionCache::new(Duration::from_secs(300), 10);
        cache.set("u1", snapshot("a@x.com"));
        cache.invalidate_user("u1");
        cache.invalidate_user("u1"); // absent, must not count
        assert!(cache.get("u1").is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn invalidate_by_role_targets_carriers() {
        let cache = PermissionCache::new(Duration::from_secs(300), 10);
        cache.set("u1", snapshot("a@x.com"));
        cache.set("u2", snapshot("b@x.com"));
        cache.invalidate_by_role("ops", |_| Ok::<_, std::io::Error>(vec!["u1".to_string()]));
        assert!(cache.get("u1").is_none());
        assert!(cache.get("u2").is_some());
    }

    #[test]
    fn invalidate_by_role_falls_back_to_full_clear() {
        let cache = PermissionCache::new(Duration::from_secs(300), 10);
        cache.set("u1", snapshot("a@x.com"));
        cache.set("u2", snapshot("b@x.com"));
        cache.invalidate_by_role("ops", |_| {
            Err::<Vec<String>, _>(std::io::Error::other("store down"))
        });
        assert!(cache.get("u1").is_none());
        assert!(cache.get("u2").is_none());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = PermissionCache::new(Duration::from_secs(300), 10);
        cache.get("nope");
        cache.set("u1", snapshot("a@x.com"));
        cache.get("u1");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);
    }
}

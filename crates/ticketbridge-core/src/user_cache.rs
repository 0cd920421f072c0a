use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::LookupError;
use crate::UserDirectory;

#[derive(Debug, Clone, Copy)]
pub struct UserCacheConfig {
    pub ttl: Duration,
    pub max_size: usize,
}

impl Default for UserCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            max_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
}

/// Outcome of [`UserCache::warm`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub requested: usize,
    pub cached: usize,
    pub skipped: usize,
    pub results: BTreeMap<String, bool>,
}

#[derive(Debug, Clone)]
struct CachedUser {
    payload: Value,
    stored_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CachedUser>,
    next_seq: u64,
}

/// Email-keyed cache of user records with a fixed TTL and batch eviction.
pub struct UserCache {
    cfg: UserCacheConfig,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
    entries: Mutex<Entries>,
}

fn cache_key(email: &str) -> String {
    email.trim().to_lowercase()
}

impl UserCache {
    pub fn new(cfg: UserCacheConfig) -> Self {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: UserCacheConfig, clock: Arc<dyn Clock>) -> Self {
        let cfg = UserCacheConfig {
            max_size: cfg.max_size.max(1),
            ..cfg
        };
        Self {
            ttl: TimeDelta::from_std(cfg.ttl).unwrap_or(TimeDelta::MAX),
            cfg,
            clock,
            entries: Mutex::new(Entries::default()),
        }
    }

    fn is_fresh(&self, entry: &CachedUser, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.stored_at) < self.ttl
    }

    pub async fn get(&self, email: &str) -> Option<Value> {
        let key = cache_key(email);
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let fresh = match entries.map.get(&key) {
            None => {
                ticketbridge_otel::metrics().record_user_cache_lookup("miss");
                return None;
            }
            Some(entry) => self.is_fresh(entry, now),
        };
        if !fresh {
            entries.map.remove(&key);
            ticketbridge_otel::metrics().record_user_cache_lookup("expired");
            debug!(email = %key, "user cache entry expired");
            return None;
        }

        ticketbridge_otel::metrics().record_user_cache_lookup("hit");
        entries.map.get(&key).map(|e| e.payload.clone())
    }

    /// Insert or overwrite. When the cache grows past `max_size`, the oldest
    /// quarter (at least one entry) is evicted in one pass.
    pub async fn put(&self, email: &str, payload: Value) {
        let key = cache_key(email);
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.map.insert(
            key,
            CachedUser {
                payload,
                stored_at: now,
                seq,
            },
        );

        if entries.map.len() > self.cfg.max_size {
            let evict = (entries.map.len() / 4).max(1);
            let mut by_age: Vec<(DateTime<Utc>, u64, String)> = entries
                .map
                .iter()
                .map(|(k, v)| (v.stored_at, v.seq, k.clone()))
                .collect();
            by_age.sort_unstable();
            for (_, _, k) in by_age.into_iter().take(evict) {
                entries.map.remove(&k);
            }
            info!(
                evicted = evict,
                remaining = entries.map.len(),
                "user cache over capacity; evicted oldest entries"
            );
        }
    }

    /// Drop every entry. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let removed = entries.map.len();
        entries.map.clear();
        info!(removed, "user cache cleared");
        removed
    }

    /// Fetch and cache each email independently. Results are keyed by the
    /// address as supplied (trimmed); blank entries are counted as skipped.
    pub async fn warm(&self, emails: &[String], directory: &dyn UserDirectory) -> WarmReport {
        let mut report = WarmReport::default();
        for email in emails {
            let given = email.trim();
            if given.is_empty() {
                report.skipped += 1;
                continue;
            }
            let key = cache_key(given);
            let cached = match directory.fetch_user_by_email(&key).await {
                Ok(user) => {
                    self.put(&key, user).await;
                    true
                }
                Err(e) => {
                    warn!(email = %key, error = %e, "cache warm lookup failed");
                    false
                }
            };
            report.results.insert(given.to_string(), cached);
        }
        report.requested = emails.len();
        report.cached = report.results.values().filter(|v| **v).count();
        info!(
            requested = report.requested,
            cached = report.cached,
            skipped = report.skipped,
            "user cache warmed"
        );
        report
    }

    /// Snapshot counts. Does not purge expired entries.
    pub async fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        let active = entries
            .map
            .values()
            .filter(|e| self.is_fresh(e, now))
            .count();
        CacheStats {
            total_entries: entries.map.len(),
            active_entries: active,
            expired_entries: entries.map.len() - active,
            max_size: self.cfg.max_size,
            ttl_seconds: self.cfg.ttl.as_secs(),
        }
    }

    /// Cache-aside lookup. Misses go to `directory`; not-found is never cached.
    pub async fn get_or_fetch(
        &self,
        email: &str,
        directory: &dyn UserDirectory,
    ) -> Result<Value, LookupError> {
        if let Some(user) = self.get(email).await {
            return Ok(user);
        }
        let key = cache_key(email);
        let user = directory.fetch_user_by_email(&key).await?;
        self.put(&key, user.clone()).await;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-08-19T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn cache(ttl_secs: u64, max_size: usize) -> (UserCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = UserCache::with_clock(
            UserCacheConfig {
                ttl: Duration::from_secs(ttl_secs),
                max_size,
            },
            clock.clone(),
        );
        (cache, clock)
    }

    struct Directory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UserDirectory for Directory {
        async fn fetch_user_by_email(&self, email: &str) -> Result<Value, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match email {
                "ghost@example.com" => Err(LookupError::NotFound(email.to_string())),
                "slow@example.com" => Err(LookupError::Timeout(Duration::from_secs(30))),
                _ => Ok(json!({ "Email": email, "Id": 1 })),
            }
        }
    }

    fn directory() -> Directory {
        Directory {
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let (cache, clock) = cache(3600, 10);
        cache.put("a@example.com", json!({"Id": 1})).await;

        clock.advance(TimeDelta::seconds(3599));
        assert_eq!(cache.get("a@example.com").await, Some(json!({"Id": 1})));

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(cache.get("a@example.com").await, None);
        assert_eq!(cache.stats().await.total_entries, 0);
    }

    #[tokio::test]
    async fn keys_are_case_and_whitespace_insensitive() {
        let (cache, _) = cache(60, 10);
        cache.put("  Alice@Example.COM ", json!({"Id": 7})).await;
        assert_eq!(cache.get("alice@example.com").await, Some(json!({"Id": 7})));
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_quarter() {
        let (cache, clock) = cache(3600, 8);
        for i in 0..9 {
            cache.put(&format!("u{i}@example.com"), json!({"Id": i})).await;
            clock.advance(TimeDelta::seconds(1));
        }

        // 9 entries > 8: evict 9 / 4 = 2 oldest.
        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 7);
        assert_eq!(cache.get("u0@example.com").await, None);
        assert_eq!(cache.get("u1@example.com").await, None);
        for i in 2..9 {
            assert!(cache.get(&format!("u{i}@example.com")).await.is_some());
        }
    }

    #[tokio::test]
    async fn same_instant_inserts_evict_in_insertion_order() {
        let (cache, _) = cache(3600, 2);
        cache.put("first@example.com", json!(1)).await;
        cache.put("second@example.com", json!(2)).await;
        cache.put("third@example.com", json!(3)).await;

        assert_eq!(cache.get("first@example.com").await, None);
        assert_eq!(cache.get("second@example.com").await, Some(json!(2)));
        assert_eq!(cache.get("third@example.com").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn stats_count_expired_without_purging() {
        let (cache, clock) = cache(100, 10);
        cache.put("old@example.com", json!(1)).await;
        clock.advance(TimeDelta::seconds(150));
        cache.put("new@example.com", json!(2)).await;

        let stats = cache.stats().await;
        assert_eq!(
            stats,
            CacheStats {
                total_entries: 2,
                active_entries: 1,
                expired_entries: 1,
                max_size: 10,
                ttl_seconds: 100,
            }
        );
        assert_eq!(cache.stats().await.total_entries, 2);
    }

    #[tokio::test]
    async fn clear_reports_removed_count() {
        let (cache, _) = cache(60, 10);
        cache.put("a@example.com", json!(1)).await;
        cache.put("b@example.com", json!(2)).await;
        assert_eq!(cache.clear().await, 2);
        assert_eq!(cache.clear().await, 0);
    }

    #[tokio::test]
    async fn warm_reports_each_email_independently() {
        let (cache, _) = cache(60, 10);
        let dir = directory();
        let emails = vec![
            "a@example.com".to_string(),
            "ghost@example.com".to_string(),
            "slow@example.com".to_string(),
            "B@example.com".to_string(),
        ];

        let report = cache.warm(&emails, &dir).await;
        assert_eq!(report.results.get("a@example.com"), Some(&true));
        assert_eq!(report.results.get("ghost@example.com"), Some(&false));
        assert_eq!(report.results.get("slow@example.com"), Some(&false));
        assert_eq!(report.results.get("B@example.com"), Some(&true));
        assert_eq!(report.cached, 2);
        assert_eq!(cache.stats().await.total_entries, 2);
    }

    #[tokio::test]
    async fn warm_keys_results_as_given_and_counts_blanks() {
        let (cache, _) = cache(60, 10);
        let dir = directory();
        let emails = vec![
            "  A@Example.com ".to_string(),
            "".to_string(),
            "   ".to_string(),
            "ghost@example.com".to_string(),
        ];

        let report = cache.warm(&emails, &dir).await;
        assert_eq!(report.requested, 4);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.cached, 1);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results.get("A@Example.com"), Some(&true));
        assert!(!report.results.contains_key("a@example.com"));

        cache.get_or_fetch("a@example.com", &dir).await.expect("cached");
        assert_eq!(dir.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn get_or_fetch_caches_hits_but_not_misses() {
        let (cache, _) = cache(60, 10);
        let dir = directory();

        cache.get_or_fetch("a@example.com", &dir).await.expect("found");
        cache.get_or_fetch("A@example.com", &dir).await.expect("cached");
        assert_eq!(dir.calls.load(Ordering::SeqCst), 1);

        for _ in 0..2 {
            let err = cache
                .get_or_fetch("ghost@example.com", &dir)
                .await
                .expect_err("not found");
            assert!(matches!(err, LookupError::NotFound(_)));
        }
        assert_eq!(dir.calls.load(Ordering::SeqCst), 3);
    }
}

//! Process local memoization with per entry expiry.
//!
//! Entries are only ever evicted by time, never by size: the map grows until a sweep runs or
//! entries are deleted.

use crate::sweep::{CallSweeper, SweepPolicy, SweepTask};
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use serde::Serialize;
use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TTL_SECONDS: i64 = 300;

/// Expired entries stay in place until [TtlCache::cleanup] runs, unless configured otherwise.
pub const DEFAULT_SWEEP_POLICY: SweepPolicy = SweepPolicy::Manual;

// Longer TTLs are clamped, roughly 30 years.
const MAX_TTL_SECONDS: i64 = 60 * 60 * 24 * 365 * 30;

/// Per call options for [TtlCache] operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Time to live in whole seconds, the cache default when unset.
    ///
    /// Zero or negative values store an entry that is already expired.
    pub ttl: Option<i64>,
    /// Namespace for the key. Lookups must use the same prefix to find the entry.
    pub prefix: Option<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, seconds: i64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_owned());
        self
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}:{key}")),
        }
    }
}

/// Counters since creation (or the last [TtlCache::reset_stats]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries physically held, including expired ones not yet swept.
    pub entries: u64,
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// An in-memory key/value cache with a time to live per entry.
///
/// Cloning is cheap and clones share the same entries; construct one per application and hand
/// it to whatever needs it (e.g. as `web::Data`).
///
/// Building with the default [SweepPolicy::Manual] needs no async runtime, an
/// interval sweep has to be built inside the actix runtime.
///
/// Values are handed out by [Clone]. Store an [Arc] when callers should observe each other's
/// mutations of a cached value.
pub struct TtlCache<V> {
    map: Arc<DashMap<String, CacheEntry<V>>>,
    counters: Arc<Counters>,
    sweeper: Arc<CallSweeper>,
    default_ttl: i64,
    _sweep_task: Option<Arc<SweepTask>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            counters: self.counters.clone(),
            sweeper: self.sweeper.clone(),
            default_ttl: self.default_ttl,
            _sweep_task: self._sweep_task.clone(),
        }
    }
}

impl<V: Clone + 'static> TtlCache<V> {
    pub fn builder() -> TtlCacheBuilder<V> {
        TtlCacheBuilder {
            default_ttl: DEFAULT_TTL_SECONDS,
            sweep_policy: DEFAULT_SWEEP_POLICY,
            _value: PhantomData,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with(key, &CacheOptions::default())
    }

    /// Returns the value if it has not expired. Expired entries count as a miss.
    pub fn get_with(&self, key: &str, options: &CacheOptions) -> Option<V> {
        let key = options.make_key(key);
        let now = Instant::now();
        let value = self
            .map
            .get(&*key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());
        let counter = match value {
            Some(_) => &self.counters.hits,
            None => &self.counters.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    pub fn set(&self, key: &str, value: V) {
        self.set_with(key, value, &CacheOptions::default())
    }

    /// Store a value, replacing any previous entry for the key along with its expiry.
    pub fn set_with(&self, key: &str, value: V, options: &CacheOptions) {
        let now = Instant::now();
        if self.sweeper.tick() {
            self.sweep(now);
        }
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let expires_at = if ttl <= 0 {
            now
        } else {
            now + Duration::from_secs(ttl.min(MAX_TTL_SECONDS) as u64)
        };
        self.map.insert(
            options.make_key(key).into_owned(),
            CacheEntry { value, expires_at },
        );
    }

    /// Returns the cached value, or computes and stores it on a miss.
    pub fn get_or_insert_with<F>(&self, key: &str, options: &CacheOptions, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get_with(key, options) {
            return value;
        }
        let value = f();
        self.set_with(key, value.clone(), options);
        value
    }
}

impl<V> TtlCache<V> {
    /// Remove an entry, returning whether a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.delete_with(key, &CacheOptions::default())
    }

    pub fn delete_with(&self, key: &str, options: &CacheOptions) -> bool {
        let now = Instant::now();
        self.map
            .remove(&*options.make_key(key))
            .is_some_and(|(_, entry)| entry.is_live(now))
    }

    /// Whether a live entry exists. Does not affect the hit and miss counters.
    pub fn exists(&self, key: &str) -> bool {
        self.exists_with(key, &CacheOptions::default())
    }

    pub fn exists_with(&self, key: &str, options: &CacheOptions) -> bool {
        let now = Instant::now();
        self.map
            .get(&*options.make_key(key))
            .is_some_and(|entry| entry.is_live(now))
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    /// Physically remove every expired entry, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        self.sweep(Instant::now())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entries: self.map.len() as u64,
        }
    }

    pub fn reset_stats(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
    }

    /// Number of entries held, including expired ones that have not been swept yet.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn sweep(&self, now: Instant) -> usize {
        let removed = sweep_map(&self.map, now);
        if removed > 0 {
            log::debug!("Swept {removed} expired cache entries");
        }
        removed
    }
}

fn sweep_map<V>(map: &DashMap<String, CacheEntry<V>>, now: Instant) -> usize {
    let before = map.len();
    map.retain(|_k, entry| entry.expires_at >= now);
    before.saturating_sub(map.len())
}

pub struct TtlCacheBuilder<V> {
    default_ttl: i64,
    sweep_policy: SweepPolicy,
    _value: PhantomData<fn() -> V>,
}

impl<V: Clone + 'static> TtlCacheBuilder<V> {
    /// Override the TTL in seconds used when none is given per call.
    pub fn with_default_ttl(mut self, seconds: i64) -> Self {
        self.default_ttl = seconds;
        self
    }

    /// Override when expired entries are removed from the internal map.
    ///
    /// Defaults to [SweepPolicy::Manual]. Call based policies count writes; reads never trigger
    /// a sweep.
    pub fn with_sweep_policy(mut self, policy: SweepPolicy) -> Self {
        self.sweep_policy = policy;
        self
    }

    /// # Panics
    ///
    /// Only with [SweepPolicy::Interval]: that spawns onto the actix runtime, and panics if
    /// called outside of one or with a zero interval.
    pub fn build(self) -> TtlCache<V> {
        let map = Arc::new(DashMap::<String, CacheEntry<V>>::new());
        let _sweep_task = match self.sweep_policy {
            SweepPolicy::Interval(interval) => {
                let map = map.clone();
                Some(Arc::new(SweepTask::spawn(interval, move |now| {
                    sweep_map(&map, now);
                })))
            }
            _ => None,
        };
        TtlCache {
            map,
            counters: Arc::new(Counters::default()),
            sweeper: Arc::new(CallSweeper::new(self.sweep_policy)),
            default_ttl: self.default_ttl,
            _sweep_task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Product {
        name: String,
    }

    fn chair() -> Product {
        Product {
            name: "Chair".to_string(),
        }
    }

    fn manual_cache<V: Clone + 'static>() -> TtlCache<V> {
        TtlCache::builder()
            .with_sweep_policy(SweepPolicy::Manual)
            .build()
    }

    #[actix_web::test]
    async fn test_round_trip() {
        tokio::time::pause();
        let cache = manual_cache();
        cache.set_with("product:42", chair(), &CacheOptions::new().ttl(5));
        assert_eq!(cache.get("product:42"), Some(chair()));
        assert!(cache.exists("product:42"));
    }

    #[actix_web::test]
    async fn test_expiry() {
        tokio::time::pause();
        let cache = manual_cache();
        cache.set_with("product:42", chair(), &CacheOptions::new().ttl(1));
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("product:42"), None);
        assert!(!cache.exists("product:42"));
        // Expired entries stay put until swept
        assert_eq!(cache.len(), 1);
    }

    #[actix_web::test]
    async fn test_default_ttl() {
        tokio::time::pause();
        let cache = TtlCache::builder()
            .with_default_ttl(10)
            .with_sweep_policy(SweepPolicy::Manual)
            .build();
        cache.set("k", 1u32);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k"), Some(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[actix_web::test]
    async fn test_non_positive_ttl_is_already_expired() {
        tokio::time::pause();
        let cache = manual_cache();
        cache.set_with("zero", 1u32, &CacheOptions::new().ttl(0));
        cache.set_with("negative", 2u32, &CacheOptions::new().ttl(-5));
        assert_eq!(cache.get("zero"), None);
        assert_eq!(cache.get("negative"), None);
        assert_eq!(cache.stats().misses, 2);
    }

    #[actix_web::test]
    async fn test_huge_ttl_is_clamped() {
        tokio::time::pause();
        let cache = manual_cache();
        cache.set_with("k", 1u32, &CacheOptions::new().ttl(i64::MAX));
        assert_eq!(cache.get("k"), Some(1));
    }

    #[actix_web::test]
    async fn test_prefix_isolation() {
        tokio::time::pause();
        let cache = manual_cache();
        let a = CacheOptions::new().prefix("a");
        let b = CacheOptions::new().prefix("b");
        cache.set_with("k", "v1", &a);
        cache.set_with("k", "v2", &b);
        assert_eq!(cache.get_with("k", &a), Some("v1"));
        assert_eq!(cache.get_with("k", &b), Some("v2"));
        assert_eq!(cache.get("k"), None);
        assert!(cache.exists_with("k", &a));
        assert!(!cache.exists("k"));
        assert!(cache.delete_with("k", &a));
        assert_eq!(cache.get_with("k", &b), Some("v2"));
    }

    #[actix_web::test]
    async fn test_delete() {
        tokio::time::pause();
        let cache = manual_cache();
        cache.set_with("product:42", chair(), &CacheOptions::new().ttl(3600));
        assert_eq!(cache.get("product:42"), Some(chair()));
        assert!(cache.delete("product:42"));
        assert_eq!(cache.get("product:42"), None);
        assert!(!cache.delete("product:42"));
    }

    #[actix_web::test]
    async fn test_delete_expired_reports_absent() {
        tokio::time::pause();
        let cache = manual_cache();
        cache.set_with("k", 1u32, &CacheOptions::new().ttl(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.delete("k"));
        assert!(cache.is_empty());
    }

    #[actix_web::test]
    async fn test_last_write_wins() {
        tokio::time::pause();
        let cache = manual_cache();
        cache.set_with("k", 1u32, &CacheOptions::new().ttl(1));
        cache.set_with("k", 2u32, &CacheOptions::new().ttl(60));
        tokio::time::advance(Duration::from_secs(2)).await;
        // The second write replaced the expiry as well as the value
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[actix_web::test]
    async fn test_stats() {
        tokio::time::pause();
        let cache = manual_cache();
        assert_eq!(cache.stats(), CacheStats::default());
        cache.set("k", 1u32);
        cache.get("k");
        cache.get("k");
        cache.get("missing");
        // exists never moves the counters
        cache.exists("k");
        cache.exists("missing");
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 2,
                misses: 1,
                entries: 1,
            }
        );
        cache.reset_stats();
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 0);
    }

    #[actix_web::test]
    async fn test_stats_serialize() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            entries: 2,
        };
        assert_eq!(
            serde_json::to_value(stats).unwrap(),
            serde_json::json!({"hits": 3, "misses": 1, "entries": 2})
        );
    }

    #[actix_web::test]
    async fn test_cleanup() {
        tokio::time::pause();
        let cache = manual_cache();
        cache.set_with("short", 1u32, &CacheOptions::new().ttl(1));
        cache.set_with("long", 2u32, &CacheOptions::new().ttl(60));
        assert_eq!(cache.cleanup(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        // Reads do not sweep
        cache.get("short");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.exists("long"));
    }

    #[test]
    fn test_default_build_without_runtime() {
        let cache = TtlCache::builder().build();
        cache.set("a", 1u32);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.cleanup(), 0);
    }

    #[actix_web::test]
    async fn test_clear() {
        let cache = manual_cache();
        cache.set("a", 1u32);
        cache.set("b", 2u32);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }

    #[actix_web::test]
    async fn test_sweep_on_writes() {
        tokio::time::pause();
        let cache = TtlCache::builder()
            .with_sweep_policy(SweepPolicy::EveryNCalls(NonZeroU64::new(2).unwrap()))
            .build();
        cache.set_with("old", 1u32, &CacheOptions::new().ttl(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.set("new", 2u32);
        assert_eq!(cache.len(), 1);
        assert!(cache.exists("new"));
    }

    #[actix_web::test]
    async fn test_sweep_interval() {
        tokio::time::pause();
        let cache = TtlCache::builder()
            .with_sweep_policy(SweepPolicy::Interval(Duration::from_secs(60)))
            .build();
        cache.set_with("short", 1u32, &CacheOptions::new().ttl(30));
        cache.set_with("long", 2u32, &CacheOptions::new().ttl(300));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.exists("long"));
    }

    #[actix_web::test]
    async fn test_clones_share_entries() {
        let cache = manual_cache();
        let handle = cache.clone();
        handle.set("k", 1u32);
        assert_eq!(cache.get("k"), Some(1));
        assert_eq!(handle.stats().hits, 1);
    }

    #[actix_web::test]
    async fn test_shared_values_reflect_mutation() {
        let cache = manual_cache();
        let product = Arc::new(Mutex::new(chair()));
        cache.set("product:42", product.clone());
        product.lock().unwrap().name = "Armchair".to_string();
        let cached = cache.get("product:42").unwrap();
        assert_eq!(cached.lock().unwrap().name, "Armchair");
    }

    #[actix_web::test]
    async fn test_get_or_insert_with() {
        tokio::time::pause();
        let cache = manual_cache();
        let options = CacheOptions::new().prefix("reports").ttl(60);
        let mut computed = 0;
        for _ in 0..3 {
            let value = cache.get_or_insert_with("monthly", &options, || {
                computed += 1;
                "report".to_string()
            });
            assert_eq!(value, "report");
        }
        assert_eq!(computed, 1);
        tokio::time::advance(Duration::from_secs(60)).await;
        cache.get_or_insert_with("monthly", &options, || {
            computed += 1;
            "report".to_string()
        });
        assert_eq!(computed, 2);
    }
}

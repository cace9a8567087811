//! Two-tier result cache.
//!
//! L1 is small and strict (LRU by default), L2 is larger and may use any
//! [`EvictionStrategy`], including the adaptive one. Lookups go L1 then L2,
//! and an L2 hit is copied back into L1 so hot keys migrate upward.
//!
//! ```text
//!   get(key) ──► L1 ──hit──► value
//!                 │ miss
//!                 ▼
//!                L2 ──hit──► promote into L1 ──► value
//!                 │           (keeps the remaining TTL)
//!                 │ miss
//!                 ▼
//!               None
//! ```
//!
//! Eviction runs inside `set`, so neither tier ever holds more entries than
//! its capacity.

mod eviction;
mod tier;

pub use eviction::EvictionStrategy;
pub use tier::{CacheEntry, CacheTier, TierStats, Weigher};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::partitioning::hash_key;
use crate::pattern::GlobPattern;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheLevel {
    L1,
    L2,
}

impl CacheLevel {
    fn label(&self) -> &'static str {
        match self {
            CacheLevel::L1 => "l1",
            CacheLevel::L2 => "l2",
        }
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    Hit { value: V, level: CacheLevel },
    Miss,
}

impl<V> CacheLookup<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            CacheLookup::Hit { value, .. } => Some(value),
            CacheLookup::Miss => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }
}

/// L1/L2 cache for pipeline results.
pub struct CacheManager<V> {
    config: CacheConfig,
    l1: CacheTier<V>,
    l2: CacheTier<V>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<V: Clone> CacheManager<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            l1: CacheTier::new("l1", config.l1.clone(), config.adaptive_window),
            l2: CacheTier::new("l2", config.l2.clone(), config.adaptive_window),
            config,
            metrics: None,
        }
    }

    /// Use `weigher` to size entries against the tiers' memory bounds.
    pub fn with_weigher(mut self, weigher: Weigher<V>) -> Self {
        self.l1 = self.l1.with_weigher(weigher.clone());
        self.l2 = self.l2.with_weigher(weigher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn enabled_tiers(&self) -> impl Iterator<Item = &CacheTier<V>> {
        [
            (self.config.l1.enabled, &self.l1),
            (self.config.l2.enabled, &self.l2),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, tier)| tier)
    }

    fn record(&self, outcome: &str, level: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(
                "cache_requests_total",
                &[("outcome", outcome), ("tier", level)],
                1.0,
            );
        }
    }

    /// Look up `key`, reporting which tier served it.
    pub fn lookup(&self, key: &str) -> CacheLookup<V> {
        if self.config.l1.enabled {
            if let Some(value) = self.l1.get(key) {
                self.record("hit", CacheLevel::L1.label());
                return CacheLookup::Hit {
                    value,
                    level: CacheLevel::L1,
                };
            }
        }

        if self.config.l2.enabled {
            if let Some((value, remaining)) = self.l2.get_with_ttl(key) {
                if self.config.l1.enabled {
                    // The copy must not outlive the L2 entry.
                    let ttl = remaining.map(|r| self.config.l1.ttl.map_or(r, |d| r.min(d)));
                    self.l1.set(key, value.clone(), ttl);
                }
                self.record("hit", CacheLevel::L2.label());
                return CacheLookup::Hit {
                    value,
                    level: CacheLevel::L2,
                };
            }
        }

        self.record("miss", "none");
        CacheLookup::Miss
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.lookup(key).into_value()
    }

    /// Write `value` to every enabled tier. `None` uses each tier's default TTL.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        for tier in self.enabled_tiers() {
            if !tier.set(key, value.clone(), ttl) {
                debug!(key, tier = tier.name(), "Entry exceeds tier memory bound");
            }
        }
    }

    /// Bulk-load entries, e.g. from a previous run.
    pub fn warm<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, V)>,
    {
        let mut loaded = 0;
        for (key, value) in entries {
            self.set(&key, value, None);
            loaded += 1;
        }
        debug!(loaded, "Cache warmed");
        loaded
    }

    /// Remove `key` from all tiers. Returns true if any tier held it.
    pub fn invalidate(&self, key: &str) -> bool {
        let l1 = self.l1.remove(key);
        let l2 = self.l2.remove(key);
        l1 || l2
    }

    /// Remove every key matching a glob (`*` and `?`) from all tiers.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let glob = GlobPattern::new(pattern)?;
        let removed =
            self.l1.remove_matching(glob.regex()) + self.l2.remove_matching(glob.regex());
        debug!(pattern, removed, "Invalidated cache pattern");
        Ok(removed)
    }

    pub fn clear(&self) {
        self.l1.clear();
        self.l2.clear();
    }

    /// Drop expired entries from both tiers.
    pub fn purge_expired(&self) -> usize {
        self.l1.purge_expired() + self.l2.purge_expired()
    }

    pub fn l1(&self) -> &CacheTier<V> {
        &self.l1
    }

    pub fn l2(&self) -> &CacheTier<V> {
        &self.l2
    }

    /// Derive a stable key from a namespace and serializable parameters.
    ///
    /// Parameters are normalized through `serde_json::Value`, whose maps are
    /// ordered, so field order does not change the key.
    pub fn generate_key<P: Serialize + ?Sized>(namespace: &str, params: &P) -> Result<String> {
        let value = serde_json::to_value(params)
            .map_err(|e| Error::Internal(format!("cannot serialize cache key params: {}", e)))?;
        let canonical = value.to_string();
        Ok(format!("{}:{:016x}", namespace, hash_key(canonical.as_bytes())))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1: self.l1.stats(),
            l2: self.l2.stats(),
        }
    }
}

/// Statistics for both tiers.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1: TierStats,
    pub l2: TierStats,
}

impl CacheStats {
    /// Fraction of lookups answered by either tier.
    pub fn overall_hit_rate(&self) -> f64 {
        // Every lookup reaching L2 was an L1 miss, so L1 counts every lookup.
        let lookups = self.l1.hits + self.l1.misses;
        if lookups == 0 {
            0.0
        } else {
            (self.l1.hits + self.l2.hits) as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use std::collections::HashMap;

    fn small_cache() -> CacheManager<String> {
        CacheManager::new(
            CacheConfig::default()
                .with_l1(TierConfig::new(2, None, EvictionStrategy::Lru))
                .with_l2(TierConfig::new(10, None, EvictionStrategy::Lru)),
        )
    }

    #[test]
    fn test_l1_lru_capacity_two() {
        let cache = small_cache();
        cache.set("A", "a".into(), None);
        cache.set("B", "b".into(), None);
        cache.set("C", "c".into(), None);

        assert!(!cache.l1().contains("A"));
        assert!(cache.l1().contains("B"));
        assert!(cache.l1().contains("C"));
        assert_eq!(cache.l1().len(), 2);
        // Still served from L2.
        assert_eq!(cache.get("A"), Some("a".to_string()));
    }

    #[test]
    fn test_l2_hit_promotes_to_l1() {
        let cache = small_cache();
        cache.set("A", "a".into(), None);
        cache.set("B", "b".into(), None);
        cache.set("C", "c".into(), None);

        assert_eq!(
            cache.lookup("A"),
            CacheLookup::Hit {
                value: "a".to_string(),
                level: CacheLevel::L2
            }
        );
        assert_eq!(
            cache.lookup("A"),
            CacheLookup::Hit {
                value: "a".to_string(),
                level: CacheLevel::L1
            }
        );
        assert_eq!(cache.lookup("missing"), CacheLookup::Miss);
    }

    #[test]
    fn test_invalidate_pattern() {
        let cache = small_cache();
        cache.set("user:1", "x".into(), None);
        cache.set("user:22", "y".into(), None);
        cache.set("order:1", "z".into(), None);

        assert_eq!(cache.invalidate_pattern("user:?").unwrap(), 1);
        assert_eq!(cache.get("user:1"), None);
        assert!(cache.get("user:22").is_some());

        cache.invalidate_pattern("user:*").unwrap();
        assert_eq!(cache.get("user:22"), None);
        assert!(cache.get("order:1").is_some());
    }

    #[test]
    fn test_pattern_escapes_regex_metacharacters() {
        let cache = small_cache();
        cache.set("a.b", "1".into(), None);
        cache.set("axb", "2".into(), None);

        cache.invalidate_pattern("a.b").unwrap();
        assert_eq!(cache.get("a.b"), None);
        assert!(cache.get("axb").is_some());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = small_cache();
        cache.set("k", "v".into(), None);
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));

        cache.set("k", "v".into(), None);
        cache.clear();
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_tier_ttls() {
        let cache: CacheManager<u32> = CacheManager::new(CacheConfig::default());
        cache.set("k", 7, None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cache.l1().contains("k"));
        assert!(cache.lookup("k").is_hit());

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_keeps_remaining_ttl() {
        let cache: CacheManager<String> = CacheManager::new(
            CacheConfig::default()
                .with_l1(TierConfig::new(1, Some(Duration::from_secs(60)), EvictionStrategy::Lru))
                .with_l2(TierConfig::new(10, Some(Duration::from_secs(300)), EvictionStrategy::Lru)),
        );
        cache.set("a", "A".into(), Some(Duration::from_secs(5)));
        cache.set("b", "B".into(), None);
        assert!(!cache.l1().contains("a"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.lookup("a").into_value().as_deref(), Some("A"));
        assert!(cache.l1().contains("a"));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!cache.l1().contains("a"));
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_capped_by_l1_ttl() {
        let cache: CacheManager<u32> = CacheManager::new(
            CacheConfig::default()
                .with_l1(TierConfig::new(1, Some(Duration::from_secs(10)), EvictionStrategy::Lru))
                .with_l2(TierConfig::new(10, None, EvictionStrategy::Lru)),
        );
        cache.set("a", 1, Some(Duration::from_secs(100)));
        cache.set("b", 2, None);
        assert!(cache.lookup("a").is_hit());
        assert!(cache.l1().contains("a"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!cache.l1().contains("a"));
        assert_eq!(
            cache.lookup("a"),
            CacheLookup::Hit {
                value: 1,
                level: CacheLevel::L2
            }
        );
    }

    #[test]
    fn test_generate_key_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("user", "42");
        a.insert("lang", "en");
        let mut b = HashMap::new();
        b.insert("lang", "en");
        b.insert("user", "42");

        let ka = CacheManager::<String>::generate_key("enrich", &a).unwrap();
        let kb = CacheManager::<String>::generate_key("enrich", &b).unwrap();
        assert_eq!(ka, kb);
        assert!(ka.starts_with("enrich:"));

        let other = CacheManager::<String>::generate_key("enrich", &("user", 43)).unwrap();
        assert_ne!(ka, other);
    }

    #[test]
    fn test_disabled_tier_is_skipped() {
        let cache: CacheManager<u32> = CacheManager::new(
            CacheConfig::default().with_l1(TierConfig::new(10, None, EvictionStrategy::Lru).disabled()),
        );
        cache.set("k", 1, None);
        assert!(cache.l1().is_empty());
        assert_eq!(
            cache.lookup("k"),
            CacheLookup::Hit {
                value: 1,
                level: CacheLevel::L2
            }
        );
    }

    #[test]
    fn test_warm_and_stats() {
        let metrics = Arc::new(MetricsCollector::default());
        let cache: CacheManager<u32> =
            CacheManager::new(CacheConfig::default()).with_metrics(metrics.clone());
        let loaded = cache.warm((0..5).map(|i| (format!("k{}", i), i)));
        assert_eq!(loaded, 5);

        cache.get("k1");
        cache.get("nope");
        let stats = cache.stats();
        assert_eq!(stats.l1.size, 5);
        assert_eq!(stats.l1.hits, 1);
        assert!((stats.overall_hit_rate() - 0.5).abs() < 1e-9);
        assert_eq!(metrics.counter_total("cache_requests_total"), 2.0);
    }

    #[test]
    fn test_adaptive_l2_stays_bounded() {
        let cache: CacheManager<u32> = CacheManager::new(
            CacheConfig::default()
                .with_l1(TierConfig::new(2, None, EvictionStrategy::Lru))
                .with_l2(TierConfig::new(5, None, EvictionStrategy::Adaptive))
                .with_adaptive_window(8),
        );
        for round in 0..20u32 {
            for i in 0..8u32 {
                cache.set(&format!("k{}", (i * 7 + round) % 11), i, None);
                cache.get(&format!("k{}", i % 3));
            }
        }
        let stats = cache.stats();
        assert!(stats.l2.size <= 5);
        assert!(stats.l2.evictions > 0);
        assert_eq!(stats.l2.strategy, EvictionStrategy::Adaptive);
    }
}

//! A single bounded cache tier.

use super::eviction::{expiry, select_victim, AdaptiveState, EvictionStrategy, RankInfo};
use crate::config::TierConfig;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Computes the size an entry counts against a tier's memory bound.
pub type Weigher<V> = Arc<dyn Fn(&str, &V) -> usize + Send + Sync>;

/// A cached value with its access metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub size: usize,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub ttl: Option<Duration>,
    insert_seq: u64,
    access_seq: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.created_at) >= ttl)
    }

    /// Time left before expiry; `None` when the entry never expires.
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.ttl
            .map(|ttl| ttl.saturating_sub(now.saturating_duration_since(self.created_at)))
    }

    fn rank(&self) -> RankInfo {
        RankInfo {
            access_seq: self.access_seq,
            insert_seq: self.insert_seq,
            access_count: self.access_count,
            expires_at: expiry(self.created_at, self.ttl),
        }
    }
}

struct TierInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Logical clock ordering inserts and accesses.
    seq: u64,
    memory: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    adaptive: Option<AdaptiveState>,
}

impl<V> TierInner<V> {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.memory = self.memory.saturating_sub(entry.size);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    fn active_strategy(&self, configured: EvictionStrategy) -> EvictionStrategy {
        match &self.adaptive {
            Some(adaptive) => adaptive.active(),
            None => configured,
        }
    }

    /// Evict one entry. Returns false when the tier is empty.
    fn evict_one(&mut self, configured: EvictionStrategy) -> bool {
        let strategy = self.active_strategy(configured);
        let victim = {
            let candidates = self.entries.iter().map(|(k, e)| (k.as_str(), e.rank()));
            if let Some(adaptive) = self.adaptive.as_mut() {
                adaptive.record_eviction(candidates.clone());
            }
            select_victim(strategy, candidates).map(str::to_string)
        };

        match victim {
            Some(key) => {
                trace!(key = %key, strategy = %strategy, "Evicting cache entry");
                self.remove(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}

/// A bounded map of cache entries with TTL and eviction.
///
/// The entry count never exceeds the configured capacity: `set` evicts
/// synchronously, after first dropping expired entries, before inserting.
pub struct CacheTier<V> {
    name: String,
    config: TierConfig,
    weigher: Weigher<V>,
    inner: Mutex<TierInner<V>>,
}

impl<V: Clone> CacheTier<V> {
    pub fn new(name: impl Into<String>, config: TierConfig, adaptive_window: usize) -> Self {
        let adaptive = (config.strategy == EvictionStrategy::Adaptive)
            .then(|| AdaptiveState::new(config.capacity, adaptive_window));
        Self {
            name: name.into(),
            weigher: Arc::new(|_, _| 1),
            inner: Mutex::new(TierInner {
                entries: HashMap::with_capacity(config.capacity.min(4096)),
                seq: 0,
                memory: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                adaptive,
            }),
            config,
        }
    }

    /// Set the function computing entry sizes for the memory bound.
    pub fn with_weigher(mut self, weigher: Weigher<V>) -> Self {
        self.weigher = weigher;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Look up `key`, refreshing its access metadata on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with_ttl(key).map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), also returning the entry's remaining TTL.
    pub fn get_with_ttl(&self, key: &str) -> Option<(V, Option<Duration>)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(adaptive) = inner.adaptive.as_mut() {
            adaptive.on_request(key);
        }

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        let seq = inner.next_seq();
        inner.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        entry.access_seq = seq;
        Some((entry.value.clone(), entry.remaining_ttl(now)))
    }

    /// Whether `key` is resident and unexpired. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Insert or replace `key`. `ttl` overrides the tier default.
    ///
    /// Returns false if the entry can never fit the memory bound.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> bool {
        let size = (self.weigher)(key, &value);
        if self.config.max_memory_bytes.is_some_and(|max| size > max) {
            return false;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.remove(key);
        if let Some(adaptive) = inner.adaptive.as_mut() {
            adaptive.forget(key);
        }

        let over_limit = |inner: &TierInner<V>| {
            inner.entries.len() >= self.config.capacity
                || self
                    .config
                    .max_memory_bytes
                    .is_some_and(|max| inner.memory + size > max)
        };

        if over_limit(&*inner) {
            inner.purge_expired(now);
        }
        while over_limit(&*inner) {
            if !inner.evict_one(self.config.strategy) {
                return false;
            }
        }

        let seq = inner.next_seq();
        inner.memory += size;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                size,
                created_at: now,
                last_accessed: now,
                access_count: 1,
                ttl: ttl.or(self.config.ttl),
                insert_seq: seq,
                access_seq: seq,
            },
        );
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove every key matching `pattern`. Returns how many were removed.
    pub fn remove_matching(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    /// Drop all expired entries.
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().purge_expired(Instant::now())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.memory = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn stats(&self) -> TierStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        TierStats {
            name: self.name.clone(),
            size: inner.entries.len(),
            capacity: self.config.capacity,
            memory_bytes: inner.memory,
            max_memory_bytes: self.config.max_memory_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            strategy: self.config.strategy,
            active_strategy: inner.active_strategy(self.config.strategy),
            strategy_switches: inner.adaptive.as_ref().map_or(0, |a| a.switches()),
        }
    }
}

impl<V> fmt::Debug for CacheTier<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTier")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("entries", &self.inner.lock().entries.len())
            .finish()
    }
}

/// Statistics for one tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub name: String,
    pub size: usize,
    pub capacity: usize,
    pub memory_bytes: usize,
    pub max_memory_bytes: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    pub strategy: EvictionStrategy,
    pub active_strategy: EvictionStrategy,
    pub strategy_switches: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(capacity: usize, strategy: EvictionStrategy) -> CacheTier<u32> {
        CacheTier::new("test", TierConfig::new(capacity, None, strategy), 10)
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let tier = tier(2, EvictionStrategy::Lru);
        tier.set("A", 1, None);
        tier.set("B", 2, None);
        tier.set("C", 3, None);

        assert!(!tier.contains("A"));
        assert!(tier.contains("B"));
        assert!(tier.contains("C"));
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_lru_respects_access() {
        let tier = tier(2, EvictionStrategy::Lru);
        tier.set("A", 1, None);
        tier.set("B", 2, None);
        assert_eq!(tier.get("A"), Some(1));
        tier.set("C", 3, None);

        assert!(tier.contains("A"));
        assert!(!tier.contains("B"));
    }

    #[test]
    fn test_lfu_and_fifo() {
        let lfu = tier(2, EvictionStrategy::Lfu);
        lfu.set("A", 1, None);
        lfu.set("B", 2, None);
        lfu.get("A");
        lfu.get("A");
        lfu.get("B");
        lfu.set("C", 3, None);
        assert!(lfu.contains("A"));
        assert!(!lfu.contains("B"));

        let fifo = tier(2, EvictionStrategy::Fifo);
        fifo.set("A", 1, None);
        fifo.set("B", 2, None);
        fifo.get("A");
        fifo.set("C", 3, None);
        assert!(!fifo.contains("A"));
        assert!(fifo.contains("B"));
    }

    #[test]
    fn test_capacity_never_exceeded() {
        for strategy in [
            EvictionStrategy::Lru,
            EvictionStrategy::Lfu,
            EvictionStrategy::Fifo,
            EvictionStrategy::Ttl,
            EvictionStrategy::Adaptive,
        ] {
            let tier = tier(7, strategy);
            for i in 0..200u32 {
                tier.set(&format!("k{}", i % 23), i, None);
                if i % 3 == 0 {
                    tier.get(&format!("k{}", i % 5));
                }
                assert!(tier.len() <= 7, "{} exceeded capacity", strategy);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let tier = CacheTier::new(
            "ttl",
            TierConfig::new(10, Some(Duration::from_secs(60)), EvictionStrategy::Lru),
            10,
        );
        tier.set("default", 1u32, None);
        tier.set("short", 2, Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(tier.get("short"), None);
        assert_eq!(tier.get("default"), Some(1));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(tier.purge_expired(), 1);
        assert!(tier.is_empty());
        assert_eq!(tier.stats().expirations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_go_before_live_ones() {
        let tier = CacheTier::new(
            "ttl",
            TierConfig::new(2, None, EvictionStrategy::Lru),
            10,
        );
        tier.set("old", 1u32, Some(Duration::from_secs(1)));
        tier.set("live", 2, None);
        tier.get("old");
        tokio::time::advance(Duration::from_secs(2)).await;

        tier.set("new", 3, None);
        assert!(tier.contains("live"));
        assert!(tier.contains("new"));
        assert_eq!(tier.stats().evictions, 0);
    }

    #[test]
    fn test_memory_bound() {
        let tier: CacheTier<String> = CacheTier::new(
            "mem",
            TierConfig::new(100, None, EvictionStrategy::Fifo).with_max_memory_bytes(10),
            10,
        )
        .with_weigher(Arc::new(|_, v: &String| v.len()));

        assert!(tier.set("a", "12345".into(), None));
        assert!(tier.set("b", "12345".into(), None));
        assert!(tier.set("c", "123".into(), None));
        assert!(!tier.contains("a"));
        assert!(tier.stats().memory_bytes <= 10);

        assert!(!tier.set("huge", "x".repeat(11), None));
    }

    #[test]
    fn test_remove_matching() {
        let tier = tier(10, EvictionStrategy::Lru);
        tier.set("user:1", 1, None);
        tier.set("user:2", 2, None);
        tier.set("order:1", 3, None);

        let pattern = Regex::new("^user:.*$").unwrap();
        assert_eq!(tier.remove_matching(&pattern), 2);
        assert_eq!(tier.keys(), vec!["order:1".to_string()]);
    }
}

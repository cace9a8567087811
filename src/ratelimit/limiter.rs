//! Per-client rate limiter.

use super::algorithms::{BucketState, Limits};
use super::{RateLimitResult, RateLimitStrategy};
use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
struct ClientBucket {
    state: BucketState,
    last_seen: Instant,
    allowed: u64,
    blocked: u64,
}

/// Admission control keyed by client id.
///
/// Buckets are created on a client's first request and reclaimed once they
/// have been idle longer than the configured timeout. Each check runs under
/// the lock of that client's map shard only.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    limits: Limits,
    clients: DashMap<String, ClientBucket>,
    total_requests: AtomicU64,
    allowed_requests: AtomicU64,
    blocked_requests: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let limits = Limits {
            rate: config.rate,
            window: config.window,
            burst: config.burst(),
            epoch: Instant::now(),
        };
        Self {
            config,
            limits,
            clients: DashMap::new(),
            total_requests: AtomicU64::new(0),
            allowed_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Largest cost a single request can ever be admitted with.
    pub fn max_cost(&self) -> u32 {
        match self.config.strategy {
            RateLimitStrategy::TokenBucket | RateLimitStrategy::LeakyBucket => self.limits.burst,
            _ => self.limits.rate,
        }
    }

    /// Atomically check and spend `cost` units of `client_id`'s budget.
    pub fn check_limit(&self, client_id: &str, cost: u32) -> RateLimitResult {
        let now = Instant::now();
        let result = {
            let mut bucket = self
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientBucket {
                    state: BucketState::new(self.config.strategy, &self.limits, now),
                    last_seen: now,
                    allowed: 0,
                    blocked: 0,
                });
            let bucket = bucket.value_mut();
            let result = bucket.state.check(&self.limits, now, cost);
            bucket.last_seen = now;
            if result.allowed {
                bucket.allowed += 1;
            } else {
                bucket.blocked += 1;
            }
            result
        };

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if result.allowed {
            self.allowed_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocked_requests.fetch_add(1, Ordering::Relaxed);
            debug!(
                client_id,
                cost,
                retry_after = ?result.retry_after,
                "Request rate limited"
            );
        }

        if let Some(metrics) = &self.metrics {
            let outcome = if result.allowed { "allowed" } else { "blocked" };
            metrics.increment_counter("rate_limit_requests_total", &[("outcome", outcome)], 1.0);
        }
        result
    }

    /// [`check_limit`](Self::check_limit) mapped to an admission error.
    pub fn admit(&self, client_id: &str, cost: u32) -> Result<RateLimitResult> {
        let result = self.check_limit(client_id, cost);
        if result.allowed {
            Ok(result)
        } else {
            Err(Error::AdmissionRejected {
                client_id: client_id.to_string(),
                retry_after: result.retry_after.unwrap_or_default(),
            })
        }
    }

    /// Wait until `cost` units are admitted.
    ///
    /// Fails immediately if `cost` exceeds what the algorithm can ever admit.
    pub async fn wait_if_needed(&self, client_id: &str, cost: u32) -> Result<()> {
        if cost > self.max_cost() {
            return Err(Error::AdmissionRejected {
                client_id: client_id.to_string(),
                retry_after: Duration::MAX,
            });
        }
        loop {
            let result = self.check_limit(client_id, cost);
            if result.allowed {
                return Ok(());
            }
            let wait = result
                .retry_after
                .filter(|d| !d.is_zero())
                .unwrap_or(Duration::from_millis(100));
            tokio::time::sleep(wait).await;
        }
    }

    /// Give a client a fresh budget.
    pub fn reset_client(&self, client_id: &str) {
        if let Some(mut bucket) = self.clients.get_mut(client_id) {
            bucket.state = BucketState::new(self.config.strategy, &self.limits, Instant::now());
        }
    }

    pub fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        let now = Instant::now();
        self.clients.get_mut(client_id).map(|mut bucket| {
            let bucket = bucket.value_mut();
            ClientStats {
                available: bucket.state.available(&self.limits, now),
                allowed: bucket.allowed,
                blocked: bucket.blocked,
                idle_for: now.saturating_duration_since(bucket.last_seen),
            }
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Drop buckets idle for longer than `threshold`. Returns how many.
    pub fn cleanup_idle_older_than(&self, threshold: Duration) -> usize {
        let now = Instant::now();
        let before = self.clients.len();
        self.clients
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= threshold);
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            debug!(removed, "Reclaimed idle rate-limit buckets");
        }
        removed
    }

    /// Drop buckets idle for longer than the configured timeout.
    pub fn cleanup_idle(&self) -> usize {
        self.cleanup_idle_older_than(self.config.idle_timeout)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let blocked = self.blocked_requests.load(Ordering::Relaxed);
        RateLimiterStats {
            strategy: self.config.strategy,
            rate: self.limits.rate,
            window: self.limits.window,
            burst: self.limits.burst,
            total_requests: total,
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            blocked_requests: blocked,
            clients: self.clients.len(),
            block_rate: if total == 0 {
                0.0
            } else {
                blocked as f64 / total as f64
            },
        }
    }

    /// Periodically reclaim idle buckets until shutdown is signalled.
    pub async fn run_cleanup_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let period = (self.config.idle_timeout / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cleanup_idle();
                }
                _ = shutdown_rx.recv() => {
                    info!("Rate limiter cleanup loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Statistics for one client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    /// Units the client could spend right now.
    pub available: f64,
    pub allowed: u64,
    pub blocked: u64,
    pub idle_for: Duration,
}

/// Global limiter statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub strategy: RateLimitStrategy,
    pub rate: u32,
    pub window: Duration,
    pub burst: u32,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub clients: usize,
    pub block_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(strategy: RateLimitStrategy, rate: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::new(strategy, rate, Duration::from_secs(1)).with_burst(burst),
        )
    }

    fn approx(actual: Duration, expected: Duration) -> bool {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        diff < Duration::from_millis(5)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_log_sixth_request_waits_for_window() {
        let limiter = limiter(RateLimitStrategy::SlidingWindowLog, 5, 5);

        for _ in 0..5 {
            assert!(limiter.check_limit("client", 1).allowed);
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        let denied = limiter.check_limit("client", 1);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        // The first request was 250ms ago; it leaves the window in 750ms.
        assert!(approx(denied.retry_after.unwrap(), Duration::from_millis(750)));

        tokio::time::advance(Duration::from_millis(750)).await;
        assert!(limiter.check_limit("client", 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_sixth_request_denied() {
        let limiter = limiter(RateLimitStrategy::TokenBucket, 5, 5);

        for _ in 0..5 {
            assert!(limiter.check_limit("client", 1).allowed);
        }
        let denied = limiter.check_limit("client", 1);
        assert!(!denied.allowed);
        // One token is replenished every 200ms.
        assert!(approx(denied.retry_after.unwrap(), Duration::from_millis(200)));

        // Other clients have their own budget.
        assert!(limiter.check_limit("other", 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_long_run_rate() {
        let limiter = limiter(RateLimitStrategy::TokenBucket, 5, 5);
        let mut accepted = 0;

        // Offer 100 req/s for 10 seconds.
        for _ in 0..1000 {
            if limiter.check_limit("client", 1).allowed {
                accepted += 1;
            }
            let available = limiter.client_stats("client").unwrap().available;
            assert!((0.0..=5.0).contains(&available));
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        // 5/s over 10s plus one initial burst.
        assert!((50..=55).contains(&accepted), "accepted {}", accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_maps_to_error() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 1, 1);
        assert!(limiter.admit("c", 1).is_ok());
        match limiter.admit("c", 1) {
            Err(Error::AdmissionRejected { client_id, retry_after }) => {
                assert_eq!(client_id, "c");
                assert!(retry_after <= Duration::from_secs(1));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_if_needed() {
        let limiter = limiter(RateLimitStrategy::TokenBucket, 10, 1);
        let start = Instant::now();

        limiter.wait_if_needed("c", 1).await.unwrap();
        limiter.wait_if_needed("c", 1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));

        assert!(limiter.wait_if_needed("c", 2).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_client_and_stats() {
        let limiter = limiter(RateLimitStrategy::LeakyBucket, 2, 2);
        limiter.check_limit("c", 2);
        assert!(!limiter.check_limit("c", 1).allowed);

        limiter.reset_client("c");
        assert!(limiter.check_limit("c", 1).allowed);

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.blocked_requests, 1);
        assert_eq!(stats.clients, 1);
        assert!((stats.block_rate - 1.0 / 3.0).abs() < 1e-9);

        let client = limiter.client_stats("c").unwrap();
        assert_eq!(client.allowed, 2);
        assert_eq!(client.blocked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_buckets_reclaimed() {
        let limiter = RateLimiter::new(
            RateLimitConfig::default().with_idle_timeout(Duration::from_secs(60)),
        );
        limiter.check_limit("old", 1);
        tokio::time::advance(Duration::from_secs(90)).await;
        limiter.check_limit("fresh", 1);

        assert_eq!(limiter.cleanup_idle(), 1);
        assert!(limiter.client_stats("old").is_none());
        assert!(limiter.client_stats("fresh").is_some());
    }
}

//! Aggregated statistics snapshot.

use crate::balancer::LoadBalancerStats;
use crate::cache::CacheStats;
use crate::processor::ProcessorStats;
use crate::queue::QueueStats;
use crate::ratelimit::RateLimiterStats;
use crate::resilience::BreakerStats;
use crate::scaling::AutoScalerStats;
use crate::sharding::ShardManagerStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct RequestCounters {
    pub total: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
    pub cache_hits: AtomicU64,
}

impl RequestCounters {
    pub fn snapshot(&self, in_flight: usize) -> RequestStats {
        let total = self.total.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        RequestStats {
            total,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cache_hits,
            cache_hit_rate: if total == 0 {
                0.0
            } else {
                cache_hits as f64 / total as f64
            },
            in_flight,
        }
    }
}

/// Request-level counters.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStats {
    pub total: u64,
    /// Successful requests, cache hits included.
    pub succeeded: u64,
    pub failed: u64,
    /// Requests refused by admission control.
    pub rejected: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    /// Requests dispatched to the processor and not yet finished.
    pub in_flight: usize,
}

/// Everything the orchestrator knows about itself, in one serializable value.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub requests: RequestStats,
    pub rate_limiter: RateLimiterStats,
    pub cache: CacheStats,
    pub queue: QueueStats,
    pub processor: ProcessorStats,
    pub balancer: LoadBalancerStats,
    pub sharding: ShardManagerStats,
    pub breakers: Vec<BreakerStats>,
    pub open_circuits: Vec<String>,
    pub autoscaler: AutoScalerStats,
}

//! Configuration types for the pipeline layer.
//!
//! Every component has its own config struct with documented defaults and
//! `with_*` builders. [`OrchestratorConfig`] aggregates them and validates
//! the whole tree before anything is constructed.

use crate::balancer::LoadBalancingStrategy;
use crate::cache::EvictionStrategy;
use crate::error::{Error, Result};
use crate::metrics::DEFAULT_BUCKETS;
use crate::processor::RetryPolicy;
use crate::queue::OverflowPolicy;
use crate::ratelimit::RateLimitStrategy;
use crate::scaling::ScalingPolicy;
use crate::sharding::ShardingStrategy;
use crate::types::Priority;
use std::time::Duration;

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Config(message()))
    }
}

/// Main configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Metrics collection configuration.
    pub metrics: MetricsConfig,

    /// Circuit breaker configuration, applied to every guarded dependency.
    pub breaker: CircuitBreakerConfig,

    /// Admission control configuration.
    pub rate_limit: RateLimitConfig,

    /// Result cache configuration.
    pub cache: CacheConfig,

    /// Request queue configuration.
    pub queue: QueueConfig,

    /// Backend selection configuration.
    pub balancer: LoadBalancerConfig,

    /// State partitioning configuration.
    pub sharding: ShardingConfig,

    /// Worker pool configuration.
    pub processor: ProcessorConfig,

    /// Auto-scaling configuration.
    pub autoscaler: AutoScalerConfig,

    /// Topic requests are published on.
    pub request_topic: String,

    /// Priority used by `process` when none is given.
    pub default_priority: Priority,

    /// How long a caller waits for its result before giving up.
    pub result_timeout: Duration,

    /// Whether successful results are written back to the cache.
    pub cache_results: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            metrics: MetricsConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            balancer: LoadBalancerConfig::default(),
            sharding: ShardingConfig::default(),
            processor: ProcessorConfig::default(),
            autoscaler: AutoScalerConfig::default(),
            request_topic: "pipeline.requests".to_string(),
            default_priority: Priority::Medium,
            result_timeout: Duration::from_secs(300),
            cache_results: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_metrics_config(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_breaker_config(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_rate_limit_config(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_balancer_config(mut self, balancer: LoadBalancerConfig) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_sharding_config(mut self, sharding: ShardingConfig) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn with_processor_config(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_autoscaler_config(mut self, autoscaler: AutoScalerConfig) -> Self {
        self.autoscaler = autoscaler;
        self
    }

    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn with_cache_results(mut self, enabled: bool) -> Self {
        self.cache_results = enabled;
        self
    }

    /// Validate every component configuration.
    pub fn validate(&self) -> Result<()> {
        self.metrics.validate()?;
        self.breaker.validate()?;
        self.rate_limit.validate()?;
        self.cache.validate()?;
        self.queue.validate()?;
        self.balancer.validate()?;
        self.sharding.validate()?;
        self.processor.validate()?;
        self.autoscaler.validate()?;
        ensure(!self.request_topic.is_empty(), || {
            "request_topic must not be empty".into()
        })?;
        ensure(!self.result_timeout.is_zero(), || {
            "result_timeout must be positive".into()
        })
    }
}

/// Metrics collection configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// How long time-series samples are kept.
    pub retention: Duration,

    /// Raw samples kept per histogram for percentile computation.
    pub max_samples: usize,

    /// Points kept per time series regardless of age.
    pub max_points: usize,

    /// Histogram bucket boundaries (seconds for latency metrics).
    pub buckets: Vec<f64>,

    /// Interval of the background pruning loop.
    pub prune_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600), // 1 hour
            max_samples: 10_000,
            max_points: 10_000,
            buckets: DEFAULT_BUCKETS.to_vec(),
            prune_interval: Duration::from_secs(60),
        }
    }
}

impl MetricsConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.max_samples > 0, || "metrics.max_samples must be > 0".into())?;
        ensure(self.max_points > 0, || "metrics.max_points must be > 0".into())?;
        ensure(!self.prune_interval.is_zero(), || {
            "metrics.prune_interval must be positive".into()
        })
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Trial successes in half-open needed to close the circuit.
    pub success_threshold: u32,

    /// Time the circuit stays open before allowing trial calls.
    pub recovery_timeout: Duration,

    /// Maximum concurrent trial calls while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.failure_threshold > 0, || {
            "breaker.failure_threshold must be > 0".into()
        })?;
        ensure(self.success_threshold > 0, || {
            "breaker.success_threshold must be > 0".into()
        })?;
        ensure(self.half_open_max_calls >= self.success_threshold, || {
            format!(
                "breaker.half_open_max_calls ({}) must be >= success_threshold ({})",
                self.half_open_max_calls, self.success_threshold
            )
        })
    }
}

/// Admission control configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Algorithm used for every client.
    pub strategy: RateLimitStrategy,

    /// Requests admitted per window.
    pub rate: u32,

    /// Window the rate is expressed over.
    pub window: Duration,

    /// Maximum burst; defaults to `rate`.
    pub burst: Option<u32>,

    /// Buckets idle for longer than this are reclaimed.
    pub idle_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::TokenBucket,
            rate: 100,
            window: Duration::from_secs(1),
            burst: None,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    /// Create a config admitting `rate` requests per `window`.
    pub fn new(strategy: RateLimitStrategy, rate: u32, window: Duration) -> Self {
        Self {
            strategy,
            rate,
            window,
            ..Default::default()
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Effective burst capacity.
    pub fn burst(&self) -> u32 {
        self.burst.unwrap_or(self.rate)
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.rate > 0, || "rate_limit.rate must be > 0".into())?;
        ensure(!self.window.is_zero(), || "rate_limit.window must be positive".into())?;
        ensure(self.burst() > 0, || "rate_limit.burst must be > 0".into())
    }
}

/// Configuration of one cache tier.
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Whether the tier participates in lookups and writes.
    pub enabled: bool,

    /// Maximum number of entries.
    pub capacity: usize,

    /// Default time-to-live for entries; `None` keeps entries until evicted.
    pub ttl: Option<Duration>,

    /// Victim selection when the tier is full.
    pub strategy: EvictionStrategy,

    /// Optional bound on the summed entry sizes.
    pub max_memory_bytes: Option<usize>,
}

impl TierConfig {
    pub fn new(capacity: usize, ttl: Option<Duration>, strategy: EvictionStrategy) -> Self {
        Self {
            enabled: true,
            capacity,
            ttl,
            strategy,
            max_memory_bytes: None,
        }
    }

    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self, tier: &str) -> Result<()> {
        ensure(!self.enabled || self.capacity > 0, || {
            format!("cache.{}.capacity must be > 0", tier)
        })?;
        ensure(self.max_memory_bytes != Some(0), || {
            format!("cache.{}.max_memory_bytes must be > 0", tier)
        })
    }
}

/// Result cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Small, fast tier consulted first.
    pub l1: TierConfig,

    /// Larger tier; hits are promoted into L1.
    pub l2: TierConfig,

    /// Number of recent ghost hits the adaptive strategy compares over.
    pub adaptive_window: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: TierConfig::new(100, Some(Duration::from_secs(60)), EvictionStrategy::Lru),
            l2: TierConfig::new(
                1000,
                Some(Duration::from_secs(300)),
                EvictionStrategy::Adaptive,
            ),
            adaptive_window: 100,
        }
    }
}

impl CacheConfig {
    pub fn with_l1(mut self, tier: TierConfig) -> Self {
        self.l1 = tier;
        self
    }

    pub fn with_l2(mut self, tier: TierConfig) -> Self {
        self.l2 = tier;
        self
    }

    pub fn with_adaptive_window(mut self, window: usize) -> Self {
        self.adaptive_window = window;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.l1.validate("l1")?;
        self.l2.validate("l2")?;
        ensure(self.adaptive_window > 0, || {
            "cache.adaptive_window must be > 0".into()
        })
    }
}

/// Request queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum pending messages across all topics and groups.
    pub capacity: usize,

    /// Behaviour of `publish` at capacity.
    pub overflow: OverflowPolicy,

    /// Time a consumer has to ack a delivered message.
    pub ack_timeout: Duration,

    /// Redeliveries allowed before a message is dead-lettered.
    pub max_redeliveries: u32,

    /// Dead letters older than this are dropped.
    pub dead_letter_ttl: Duration,

    /// Interval of the ack-deadline monitor loop.
    pub monitor_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            overflow: OverflowPolicy::Reject,
            ack_timeout: Duration::from_secs(30),
            max_redeliveries: 3,
            dead_letter_ttl: Duration::from_secs(86_400), // 24 hours
            monitor_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_max_redeliveries(mut self, redeliveries: u32) -> Self {
        self.max_redeliveries = redeliveries;
        self
    }

    pub fn with_dead_letter_ttl(mut self, ttl: Duration) -> Self {
        self.dead_letter_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.capacity > 0, || "queue.capacity must be > 0".into())?;
        ensure(!self.ack_timeout.is_zero(), || {
            "queue.ack_timeout must be positive".into()
        })?;
        ensure(!self.monitor_interval.is_zero(), || {
            "queue.monitor_interval must be positive".into()
        })
    }
}

/// Weights of the adaptive balancing score. Lower scores win.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveWeights {
    pub latency: f64,
    pub error_rate: f64,
    pub connections: f64,
    pub weight: f64,
}

impl Default for AdaptiveWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            error_rate: 0.3,
            connections: 0.2,
            weight: 0.1,
        }
    }
}

/// Backend selection configuration.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// Selection strategy.
    pub strategy: LoadBalancingStrategy,

    /// Pin each client key to one backend while it is healthy.
    pub sticky_sessions: bool,

    /// Interval of the health-check loop.
    pub health_check_interval: Duration,

    /// Timeout of a single health probe.
    pub probe_timeout: Duration,

    /// Consecutive probe failures that mark a backend unhealthy.
    pub unhealthy_threshold: u32,

    /// Consecutive probe successes that restore a backend.
    pub healthy_threshold: u32,

    /// Distinct backends `execute_request` tries before giving up.
    pub max_attempts: usize,

    /// Latency samples kept per backend for the rolling average.
    pub latency_window: usize,

    /// Adaptive strategy weights.
    pub adaptive_weights: AdaptiveWeights,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            sticky_sessions: false,
            health_check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            max_attempts: 3,
            latency_window: 100,
            adaptive_weights: AdaptiveWeights::default(),
        }
    }
}

impl LoadBalancerConfig {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_sticky_sessions(mut self, enabled: bool) -> Self {
        self.sticky_sessions = enabled;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_adaptive_weights(mut self, weights: AdaptiveWeights) -> Self {
        self.adaptive_weights = weights;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.unhealthy_threshold > 0 && self.healthy_threshold > 0, || {
            "balancer health thresholds must be > 0".into()
        })?;
        ensure(self.max_attempts > 0, || "balancer.max_attempts must be > 0".into())?;
        ensure(self.latency_window > 0, || {
            "balancer.latency_window must be > 0".into()
        })?;
        ensure(!self.health_check_interval.is_zero(), || {
            "balancer.health_check_interval must be positive".into()
        })
    }
}

/// State partitioning configuration.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// How partition keys map to shards.
    pub strategy: ShardingStrategy,

    /// Copies of each record, primary included.
    pub replication_factor: usize,

    /// Virtual nodes per shard on the consistent hash ring.
    pub virtual_nodes: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            strategy: ShardingStrategy::ConsistentHash,
            replication_factor: 2,
            virtual_nodes: crate::partitioning::DEFAULT_VNODES_PER_NODE,
        }
    }
}

impl ShardingConfig {
    pub fn new(strategy: ShardingStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor;
        self
    }

    pub fn with_virtual_nodes(mut self, vnodes: usize) -> Self {
        self.virtual_nodes = vnodes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.replication_factor > 0, || {
            "sharding.replication_factor must be > 0".into()
        })?;
        ensure(self.virtual_nodes > 0, || {
            "sharding.virtual_nodes must be > 0".into()
        })
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Workers in the CPU pool.
    pub cpu_workers: usize,

    /// Workers in the IO pool.
    pub io_workers: usize,

    /// Attempts per task, first attempt included.
    pub max_attempts: u32,

    /// Backoff between attempts.
    pub retry: RetryPolicy,

    /// Per-attempt deadline; `None` disables the timeout.
    pub task_timeout: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            cpu_workers: cpus,
            io_workers: cpus * 4,
            max_attempts: 3,
            retry: RetryPolicy::default(),
            task_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ProcessorConfig {
    pub fn with_workers(mut self, cpu_workers: usize, io_workers: usize) -> Self {
        self.cpu_workers = cpu_workers;
        self.io_workers = io_workers;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.cpu_workers > 0 && self.io_workers > 0, || {
            "processor pools need at least one worker".into()
        })?;
        ensure(self.max_attempts > 0, || {
            "processor.max_attempts must be > 0".into()
        })?;
        ensure(self.retry.max_delay >= self.retry.base_delay, || {
            "processor.retry.max_delay must be >= base_delay".into()
        })
    }
}

/// Auto-scaling configuration.
#[derive(Debug, Clone)]
pub struct AutoScalerConfig {
    /// Policies evaluated on each tick. No policies disables scaling.
    pub policies: Vec<ScalingPolicy>,

    /// Interval of the evaluation loop.
    pub evaluation_interval: Duration,

    /// Observations kept per policy for trend estimation.
    pub history_size: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
            evaluation_interval: Duration::from_secs(30),
            history_size: 60,
        }
    }
}

impl AutoScalerConfig {
    pub fn with_policy(mut self, policy: ScalingPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_evaluation_interval(mut self, interval: Duration) -> Self {
        self.evaluation_interval = interval;
        self
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(!self.evaluation_interval.is_zero(), || {
            "autoscaler.evaluation_interval must be positive".into()
        })?;
        ensure(self.history_size >= 2, || {
            "autoscaler.history_size must be >= 2".into()
        })?;
        for policy in &self.policies {
            policy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.l1.capacity, 100);
        assert_eq!(config.cache.l2.strategy, EvictionStrategy::Adaptive);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.queue.max_redeliveries, 3);
    }

    #[test]
    fn test_burst_defaults_to_rate() {
        let config = RateLimitConfig::new(
            RateLimitStrategy::TokenBucket,
            5,
            Duration::from_secs(1),
        );
        assert_eq!(config.burst(), 5);
        assert_eq!(config.with_burst(8).burst(), 8);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let config = OrchestratorConfig::default().with_breaker_config(
            CircuitBreakerConfig::default().with_failure_threshold(0),
        );
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = OrchestratorConfig::default()
            .with_processor_config(ProcessorConfig::default().with_workers(0, 1));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = OrchestratorConfig::default()
            .with_cache_config(CacheConfig::default().with_l1(TierConfig::new(
                0,
                None,
                EvictionStrategy::Lru,
            )));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}

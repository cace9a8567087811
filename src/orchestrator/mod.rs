//! The orchestrator: one entry point wiring every component together.
//!
//! ```text
//!   process(item, client)
//!       │
//!       ├─► RateLimiter ── rejected ──► AdmissionRejected
//!       ├─► CacheManager ── hit ──────► value
//!       ▼
//!   MessageQueue ("pipeline.requests")
//!       │  dispatcher loop, bounded by the pool size
//!       ▼
//!   DistributedProcessor ── per attempt ──► ShardManager (placement)
//!                                        ► LoadBalancer (backend)
//!                                        ► CircuitBreaker ► stages
//!       │
//!       ├─► ack + cache + shard write      (success)
//!       └─► nack to "<topic>.dlq"          (permanent failure)
//! ```
//!
//! Background loops (dispatch, ack deadlines, health checks, auto-scaling,
//! metric pruning, idle rate buckets) start with [`Orchestrator::start`] and
//! stop with [`Orchestrator::shutdown`].

mod dispatch;
mod stats;

pub use stats::{OrchestratorStats, RequestStats};

use crate::balancer::{Backend, HealthProbe, LoadBalancer};
use crate::cache::{CacheLookup, CacheManager, Weigher};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::processor::DistributedProcessor;
use crate::queue::MessageQueue;
use crate::ratelimit::RateLimiter;
use crate::resilience::BreakerRegistry;
use crate::scaling::{AutoScaler, ScaleTarget};
use crate::sharding::{ShardManager, StoreRef};
use crate::stage::{chain_resource_class, PipelineItem, StageRef};
use crate::types::Priority;
use dispatch::{backend_dependency, Dispatcher};
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Builds an [`Orchestrator`].
pub struct OrchestratorBuilder<T> {
    config: OrchestratorConfig,
    stages: Vec<StageRef<T>>,
    probe: Option<Arc<dyn HealthProbe>>,
    weigher: Option<Weigher<T>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<T: PipelineItem> OrchestratorBuilder<T> {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            probe: None,
            weigher: None,
            metrics: None,
        }
    }

    /// Append a stage to the chain.
    pub fn stage(mut self, stage: StageRef<T>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(mut self, stages: impl IntoIterator<Item = StageRef<T>>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Active health probe for backends; without one only passive checks apply.
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Size function for cache memory bounds.
    pub fn weigher(mut self, weigher: Weigher<T>) -> Self {
        self.weigher = Some(weigher);
        self
    }

    /// Share an existing collector instead of creating one.
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Orchestrator<T>> {
        self.config.validate()?;
        if self.stages.is_empty() {
            return Err(Error::Config("at least one stage is required".into()));
        }
        let config = self.config;
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsCollector::new(config.metrics.clone())));

        let breakers =
            Arc::new(BreakerRegistry::new(config.breaker.clone()).with_metrics(metrics.clone()));
        let rate_limiter =
            Arc::new(RateLimiter::new(config.rate_limit.clone()).with_metrics(metrics.clone()));

        let mut cache = CacheManager::new(config.cache.clone()).with_metrics(metrics.clone());
        if let Some(weigher) = self.weigher {
            cache = cache.with_weigher(weigher);
        }

        let queue = Arc::new(MessageQueue::new(config.queue.clone()).with_metrics(metrics.clone()));

        let mut balancer = LoadBalancer::new(config.balancer.clone()).with_metrics(metrics.clone());
        if let Some(probe) = self.probe {
            balancer = balancer.with_probe(probe);
        }

        let shards = Arc::new(
            ShardManager::new(config.sharding.clone())
                .with_breakers(breakers.clone())
                .with_metrics(metrics.clone()),
        );
        let processor = Arc::new(
            DistributedProcessor::new(config.processor.clone()).with_metrics(metrics.clone()),
        );

        let class = chain_resource_class(&self.stages);
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            self.stages.into(),
            class,
            metrics.clone(),
            breakers,
            Arc::new(cache),
            queue,
            Arc::new(balancer),
            shards,
            processor.clone(),
        ));

        let target: Arc<dyn ScaleTarget> = Arc::new(processor.pool(class).clone());
        let signals = dispatcher.clone();
        let autoscaler = Arc::new(
            AutoScaler::new(config.autoscaler.clone(), target, metrics.clone())
                .with_refresh(Arc::new(move |metrics: &MetricsCollector| {
                    signals.publish_signals(metrics)
                })),
        );

        info!(
            stages = dispatcher.stages.len(),
            pool = %class,
            topic = %config.request_topic,
            "Orchestrator built"
        );
        Ok(Orchestrator {
            config,
            dispatcher,
            rate_limiter,
            autoscaler,
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// Resilience and scaling layer in front of a chain of pipeline stages.
pub struct Orchestrator<T> {
    config: OrchestratorConfig,
    dispatcher: Arc<Dispatcher<T>>,
    rate_limiter: Arc<RateLimiter>,
    autoscaler: Arc<AutoScaler>,
    loops: Mutex<Vec<(mpsc::Sender<()>, JoinHandle<()>)>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl<T: PipelineItem> Orchestrator<T> {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder<T> {
        OrchestratorBuilder::new(config)
    }

    pub fn new(config: OrchestratorConfig, stages: Vec<StageRef<T>>) -> Result<Self> {
        Self::builder(config).stages(stages).build()
    }

    /// Start the processor pools and every background loop.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let core = &self.dispatcher;
        core.processor.start()?;

        self.spawn_loop(|rx| core.clone().run_dispatch_loop(rx));
        self.spawn_loop(|rx| core.queue.clone().run_ack_monitor_loop(rx));
        self.spawn_loop(|rx| core.balancer.clone().run_health_check_loop(rx));
        self.spawn_loop(|rx| core.clone().run_shard_health_loop(rx));
        self.spawn_loop(|rx| core.metrics.clone().run_pruning_loop(rx));
        self.spawn_loop(|rx| self.rate_limiter.clone().run_cleanup_loop(rx));
        if !self.config.autoscaler.policies.is_empty() {
            self.spawn_loop(|rx| self.autoscaler.clone().run_evaluation_loop(rx));
        }

        info!(loops = self.loops.lock().len(), "Orchestrator started");
        Ok(())
    }

    fn spawn_loop<F, Fut>(&self, f: F)
    where
        F: FnOnce(mpsc::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(f(rx));
        self.loops.lock().push((tx, handle));
    }

    /// Process one item at the default priority.
    pub async fn process(&self, item: T, client_id: &str) -> Result<T> {
        self.process_with_priority(item, client_id, self.config.default_priority)
            .await
    }

    pub async fn process_with_priority(
        &self,
        item: T,
        client_id: &str,
        priority: Priority,
    ) -> Result<T> {
        let core = &self.dispatcher;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        core.counters.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        if let Err(e) = self.rate_limiter.admit(client_id, 1) {
            core.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.record_outcome("rejected", started);
            return Err(e);
        }

        let cache_key = item.cache_key();
        if self.config.cache_results {
            if let CacheLookup::Hit { value, level } = core.cache.lookup(&cache_key) {
                debug!(key = %cache_key, level = ?level, "Served from cache");
                core.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                core.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                self.record_outcome("cache_hit", started);
                return Ok(value);
            }
        }

        let result = core.submit(item, client_id, priority).await;
        match &result {
            Ok(_) => {
                core.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                self.record_outcome("success", started);
            }
            Err(e) => {
                core.counters.failed.fetch_add(1, Ordering::Relaxed);
                core.metrics.increment_counter(
                    "pipeline_errors_total",
                    &[("kind", e.root_cause().kind())],
                    1.0,
                );
                self.record_outcome("error", started);
            }
        }
        result
    }

    fn record_outcome(&self, outcome: &str, started: Instant) {
        let metrics = &self.dispatcher.metrics;
        metrics.increment_counter("pipeline_requests_total", &[("outcome", outcome)], 1.0);
        metrics.observe_duration("pipeline_request_duration_seconds", &[], started.elapsed());
    }

    /// Process items concurrently. Each result is independent of the others.
    pub async fn process_batch(&self, items: Vec<T>, client_id: &str) -> Vec<Result<T>> {
        join_all(items.into_iter().map(|item| self.process(item, client_id))).await
    }

    pub fn add_shard(
        &self,
        id: &str,
        primary: StoreRef<T>,
        replicas: Vec<StoreRef<T>>,
    ) -> Result<()> {
        self.dispatcher.shards.add_shard(id, primary, replicas)
    }

    /// Add a shard backed by in-memory stores.
    pub fn add_in_memory_shard(&self, id: &str) -> Result<()> {
        self.dispatcher.shards.add_in_memory_shard(id)
    }

    pub fn remove_shard(&self, id: &str) -> bool {
        let removed = self.dispatcher.shards.remove_shard(id);
        if removed {
            self.dispatcher.breakers.remove(&format!("shard:{}", id));
        }
        removed
    }

    pub fn add_backend(
        &self,
        id: &str,
        address: impl Into<String>,
        weight: u32,
    ) -> Result<Arc<Backend>> {
        self.dispatcher.balancer.add_backend(id, address, weight)
    }

    pub fn remove_backend(&self, id: &str) -> bool {
        let removed = self.dispatcher.balancer.remove_backend(id);
        if removed {
            self.dispatcher.breakers.remove(&backend_dependency(id));
        }
        removed
    }

    pub fn get_comprehensive_stats(&self) -> OrchestratorStats {
        let core = &self.dispatcher;
        OrchestratorStats {
            requests: core.counters.snapshot(core.in_flight()),
            rate_limiter: self.rate_limiter.stats(),
            cache: core.cache.stats(),
            queue: core.queue.stats(),
            processor: core.processor.stats(),
            balancer: core.balancer.stats(),
            sharding: core.shards.stats(),
            breakers: core.breakers.all_stats(),
            open_circuits: core.breakers.open_circuits(),
            autoscaler: self.autoscaler.stats(),
        }
    }

    /// Plain-text metrics exposition.
    pub fn metrics_exposition(&self) -> String {
        self.dispatcher.metrics.to_prometheus()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.dispatcher.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.dispatcher.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn cache(&self) -> &Arc<CacheManager<T>> {
        &self.dispatcher.cache
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.dispatcher.balancer
    }

    pub fn shards(&self) -> &Arc<ShardManager<T>> {
        &self.dispatcher.shards
    }

    pub fn processor(&self) -> &Arc<DistributedProcessor> {
        &self.dispatcher.processor
    }

    pub fn autoscaler(&self) -> &Arc<AutoScaler> {
        &self.autoscaler
    }

    /// Stop every loop, cancel queued work and fail pending requests with
    /// `Error::Cancelled`.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let loops = std::mem::take(&mut *self.loops.lock());
        for (tx, _) in &loops {
            let _ = tx.send(()).await;
        }
        for (_, handle) in loops {
            let _ = handle.await;
        }

        let core = &self.dispatcher;
        core.processor.shutdown();
        core.shards.flush_replication().await;
        let pending = core.cancel_waiters();
        info!(pending, "Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessorConfig, RateLimitConfig};
    use crate::error::StageError;
    use crate::queue::dead_letter_topic;
    use crate::ratelimit::RateLimitStrategy;
    use crate::stage::{PipelineStage, StageContext};
    use crate::types::ResourceClass;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Upper;

    #[async_trait]
    impl PipelineStage<String> for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn process(
            &self,
            item: String,
            _ctx: &StageContext,
        ) -> std::result::Result<String, StageError> {
            if item.starts_with("bad") {
                return Err(StageError::fatal("upper", format!("rejected {}", item)));
            }
            Ok(item.to_uppercase())
        }
    }

    /// Records the backend and shard each attempt ran with.
    struct Tag;

    #[async_trait]
    impl PipelineStage<String> for Tag {
        fn name(&self) -> &str {
            "tag"
        }

        fn resource_class(&self) -> ResourceClass {
            ResourceClass::Io
        }

        async fn process(
            &self,
            item: String,
            ctx: &StageContext,
        ) -> std::result::Result<String, StageError> {
            Ok(format!(
                "{}@{}/{}",
                item,
                ctx.backend.as_deref().unwrap_or("-"),
                ctx.shard_id.as_deref().unwrap_or("-")
            ))
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_processor_config(ProcessorConfig::default().with_workers(2, 2))
            .with_result_timeout(Duration::from_secs(10))
    }

    fn orchestrator(
        config: OrchestratorConfig,
        stages: Vec<StageRef<String>>,
    ) -> Orchestrator<String> {
        let orchestrator = Orchestrator::new(config, stages).unwrap();
        orchestrator.start().unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_process_then_cache_hit() {
        let o = orchestrator(config(), vec![Arc::new(Upper)]);

        assert_eq!(o.process("hello".into(), "alice").await.unwrap(), "HELLO");
        assert_eq!(o.process("hello".into(), "alice").await.unwrap(), "HELLO");

        let stats = o.get_comprehensive_stats();
        assert_eq!(stats.requests.total, 2);
        assert_eq!(stats.requests.cache_hits, 1);
        assert_eq!(stats.requests.succeeded, 2);
        assert_eq!(stats.queue.acked, 1);
        assert_eq!(stats.processor.submitted, 1);
        o.shutdown().await;
    }

    #[tokio::test]
    async fn test_admission_rejected() {
        let o = orchestrator(
            config().with_rate_limit_config(RateLimitConfig::new(
                RateLimitStrategy::FixedWindow,
                2,
                Duration::from_secs(60),
            )),
            vec![Arc::new(Upper)],
        );

        o.process("a".into(), "bob").await.unwrap();
        o.process("b".into(), "bob").await.unwrap();
        let err = o.process("c".into(), "bob").await.unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected { .. }));
        // Other clients have their own budget.
        o.process("c".into(), "carol").await.unwrap();

        assert_eq!(o.get_comprehensive_stats().requests.rejected, 1);
        o.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dead_lettered() {
        let o = orchestrator(config(), vec![Arc::new(Upper)]);

        let err = o.process("bad-input".into(), "alice").await.unwrap_err();
        match &err {
            Error::TaskFailedPermanently { attempts, .. } => assert_eq!(*attempts, 1),
            other => panic!("unexpected error: {}", other),
        }
        let dlq = o
            .dispatcher
            .queue
            .dead_letters(Some(dead_letter_topic("pipeline.requests").as_str()));
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].message.payload.item, "bad-input");
        // A fatal stage error does not count against the breaker.
        assert!(o.breakers().open_circuits().is_empty());
        o.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let o = orchestrator(config(), vec![Arc::new(Upper)]);
        let results = o
            .process_batch(vec!["x".into(), "bad".into(), "y".into()], "alice")
            .await;
        assert_eq!(results[0].as_ref().unwrap(), "X");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), "Y");
        o.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_and_shard_placement() {
        let o = orchestrator(config().with_cache_results(false), vec![Arc::new(Tag)]);
        o.add_backend("b1", "10.0.0.1:80", 1).unwrap();
        o.add_in_memory_shard("s1").unwrap();

        let out = o.process("item".into(), "alice").await.unwrap();
        assert_eq!(out, "item@b1/s1");

        let stored = o.shards().read("item").await.unwrap();
        assert_eq!(stored.value, Some("item@b1/s1".to_string()));
        assert_eq!(o.balancer().stats().total_requests, 1);
        assert!(o.breakers().get("backend:b1").is_some());

        assert!(o.remove_backend("b1"));
        assert!(o.breakers().get("backend:b1").is_none());
        o.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_serialize_and_exposition() {
        let o = orchestrator(config(), vec![Arc::new(Upper)]);
        o.process("a".into(), "alice").await.unwrap();

        let json = serde_json::to_value(o.get_comprehensive_stats()).unwrap();
        assert_eq!(json["requests"]["succeeded"], 1);
        assert!(json["processor"]["cpu"].is_object());

        let text = o.metrics_exposition();
        assert!(text.contains("pipeline_requests_total"));
        o.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let o = orchestrator(config(), vec![Arc::new(Upper)]);
        o.shutdown().await;
        assert!(matches!(
            o.process("late".into(), "alice").await,
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_build_requires_stages() {
        assert!(Orchestrator::<String>::new(OrchestratorConfig::default(), Vec::new()).is_err());
    }
}
